use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What a metric consumes per unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
	PerSession,
	PerCase,
}

/// How case aggregates are merged into the corpus aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingPolicy {
	/// Every case counts once, however many units it contributed.
	#[default]
	PerCase,
	/// Cases are weighted by their number of successful units.
	PerUnit,
}

/// Declared output shape of a metric. Fixed at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputShape {
	Scalar { min: f64, max: f64 },
	Subscales { names: Vec<String>, min: f64, max: f64 },
	Categorical { labels: Vec<String> },
}

impl OutputShape {
	pub fn scalar(min: f64, max: f64) -> Self {
		OutputShape::Scalar { min, max }
	}

	pub fn subscales<I, S>(names: I, min: f64, max: f64) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		OutputShape::Subscales {
			names: names.into_iter().map(Into::into).collect(),
			min,
			max,
		}
	}

	pub fn categorical<I, S>(labels: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		OutputShape::Categorical {
			labels: labels.into_iter().map(Into::into).collect(),
		}
	}

	/// Checks that `value` conforms to this shape; the error describes the mismatch.
	pub fn check(&self, value: &ScoreValue) -> Result<(), String> {
		match (self, value) {
			(OutputShape::Scalar { min, max }, ScoreValue::Scalar(x)) => {
				check_range("value", *x, *min, *max)
			}
			(OutputShape::Subscales { names, min, max }, ScoreValue::Subscales(values)) => {
				if values.len() != names.len() || names.iter().any(|n| !values.contains_key(n)) {
					let got: Vec<&str> = values.keys().map(String::as_str).collect();
					return Err(format!("expected subscales {:?}, got {:?}", names, got));
				}
				for (name, x) in values {
					check_range(name, *x, *min, *max)?;
				}
				Ok(())
			}
			(OutputShape::Categorical { labels }, ScoreValue::Category(label)) => {
				if labels.iter().any(|l| l == label) {
					Ok(())
				} else {
					Err(format!("label {:?} is not one of {:?}", label, labels))
				}
			}
			(shape, value) => Err(format!(
				"{} value does not fit a {} shape",
				value.kind(),
				shape.kind()
			)),
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			OutputShape::Scalar { .. } => "scalar",
			OutputShape::Subscales { .. } => "subscales",
			OutputShape::Categorical { .. } => "categorical",
		}
	}
}

fn check_range(name: &str, x: f64, min: f64, max: f64) -> Result<(), String> {
	if !x.is_finite() {
		return Err(format!("{name} is not a finite number"));
	}
	if x < min || x > max {
		return Err(format!("{name} = {x} is outside [{min}, {max}]"));
	}
	Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
	pub name: String,
	pub granularity: Granularity,
	pub shape: OutputShape,
}

impl MetricDescriptor {
	pub fn new(name: impl Into<String>, granularity: Granularity, shape: OutputShape) -> Self {
		Self { name: name.into(), granularity, shape }
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScoreValue {
	Scalar(f64),
	Subscales(BTreeMap<String, f64>),
	Category(String),
}

impl ScoreValue {
	pub fn kind(&self) -> &'static str {
		match self {
			ScoreValue::Scalar(_) => "scalar",
			ScoreValue::Subscales(_) => "subscales",
			ScoreValue::Category(_) => "categorical",
		}
	}

	pub fn as_scalar(&self) -> Option<f64> {
		match self {
			ScoreValue::Scalar(x) => Some(*x),
			_ => None,
		}
	}
}

/// What one unit of work was evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum Target {
	Case,
	Session(u32),
}

impl fmt::Display for Target {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Target::Case => f.write_str("case"),
			Target::Session(i) => write!(f, "session {i}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
	pub metric: String,
	pub case_id: String,
	pub target: Target,
	pub value: ScoreValue,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	JudgeUnavailable,
	JudgeRejected,
	UnparsableResult,
	InvalidTarget,
	DataIntegrity,
	Timeout,
	Cancelled,
	Panicked,
}

impl FailureKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			FailureKind::JudgeUnavailable => "judge_unavailable",
			FailureKind::JudgeRejected => "judge_rejected",
			FailureKind::UnparsableResult => "unparsable_result",
			FailureKind::InvalidTarget => "invalid_target",
			FailureKind::DataIntegrity => "data_integrity",
			FailureKind::Timeout => "timeout",
			FailureKind::Cancelled => "cancelled",
			FailureKind::Panicked => "panicked",
		}
	}
}

impl fmt::Display for FailureKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
	/// `None` for failures that concern the whole case rather than one metric.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub metric: Option<String>,
	pub case_id: String,
	pub target: Target,
	pub kind: FailureKind,
	pub message: String,
}

impl FailureRecord {
	pub fn for_metric(
		metric: impl Into<String>,
		case_id: impl Into<String>,
		target: Target,
		kind: FailureKind,
		message: impl Into<String>,
	) -> Self {
		Self {
			metric: Some(metric.into()),
			case_id: case_id.into(),
			target,
			kind,
			message: message.into(),
		}
	}

	pub fn integrity(case_id: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			metric: None,
			case_id: case_id.into(),
			target: Target::Case,
			kind: FailureKind::DataIntegrity,
			message: message.into(),
		}
	}
}

/// Terminal result of one work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
	Succeeded(ScoreRecord),
	Failed(FailureRecord),
}

impl UnitOutcome {
	pub fn metric(&self) -> Option<&str> {
		match self {
			UnitOutcome::Succeeded(s) => Some(&s.metric),
			UnitOutcome::Failed(f) => f.metric.as_deref(),
		}
	}

	pub fn target(&self) -> Target {
		match self {
			UnitOutcome::Succeeded(s) => s.target,
			UnitOutcome::Failed(f) => f.target,
		}
	}

	pub fn is_success(&self) -> bool {
		matches!(self, UnitOutcome::Succeeded(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scalar_range_is_enforced() {
		let shape = OutputShape::scalar(0.0, 10.0);
		assert!(shape.check(&ScoreValue::Scalar(7.5)).is_ok());
		assert!(shape.check(&ScoreValue::Scalar(10.5)).is_err());
		assert!(shape.check(&ScoreValue::Scalar(f64::NAN)).is_err());
	}

	#[test]
	fn subscales_must_match_names_exactly() {
		let shape = OutputShape::subscales(["positive", "negative"], 0.0, 10.0);
		let mut values = BTreeMap::new();
		values.insert("positive".to_string(), 4.0);
		assert!(shape.check(&ScoreValue::Subscales(values.clone())).is_err());
		values.insert("negative".to_string(), 2.0);
		assert!(shape.check(&ScoreValue::Subscales(values)).is_ok());
	}

	#[test]
	fn category_outside_label_set_is_rejected() {
		let shape = OutputShape::categorical(["aligned", "misaligned"]);
		assert!(shape.check(&ScoreValue::Category("aligned".into())).is_ok());
		let err = shape.check(&ScoreValue::Category("unknown".into())).unwrap_err();
		assert!(err.contains("unknown"));
	}

	#[test]
	fn mismatched_kind_is_rejected() {
		let shape = OutputShape::categorical(["aligned"]);
		assert!(shape.check(&ScoreValue::Scalar(1.0)).is_err());
	}
}
