use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::case::{Stage, TherapySchool};
use crate::record::{FailureRecord, ScoreRecord, WeightingPolicy};

/// Summary statistics for one metric, shaped like the metric's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricAggregate {
	Scalar {
		count: usize,
		mean: f64,
		variance: f64,
		stdev: f64,
	},
	Subscales {
		count: usize,
		means: BTreeMap<String, f64>,
	},
	Categorical {
		count: usize,
		/// Relative share of each label; sums to 1 when `count > 0`.
		shares: BTreeMap<String, f64>,
		counts: BTreeMap<String, usize>,
		#[serde(skip_serializing_if = "Option::is_none", default)]
		mode: Option<String>,
	},
}

impl MetricAggregate {
	pub fn count(&self) -> usize {
		match self {
			MetricAggregate::Scalar { count, .. }
			| MetricAggregate::Subscales { count, .. }
			| MetricAggregate::Categorical { count, .. } => *count,
		}
	}

	pub fn mean(&self) -> Option<f64> {
		match self {
			MetricAggregate::Scalar { mean, .. } => Some(*mean),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
	pub metric: String,
	pub weight: f64,
	pub weighting: WeightingPolicy,
	pub succeeded: usize,
	pub failed: usize,
	pub coverage: f64,
	/// Absent when no unit of this metric succeeded.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub aggregate: Option<MetricAggregate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
	pub stage: Stage,
	pub metrics: Vec<MetricSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
	pub case_id: String,
	pub school: TherapySchool,
	pub scores: Vec<ScoreRecord>,
	pub failures: Vec<FailureRecord>,
	pub metrics: Vec<MetricSummary>,
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub stages: Vec<StageSummary>,
	pub coverage: f64,
	/// Weighted mean of the scalar metric means, if any scalar metric succeeded.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub composite: Option<f64>,
	/// False when the case hit its time budget, was cancelled, or failed its walk.
	pub complete: bool,
}

impl CaseReport {
	pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
		self.metrics.iter().find(|m| m.metric == name)
	}

	pub fn scores_for<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = &'a ScoreRecord> + 'a {
		self.scores.iter().filter(move |s| s.metric == metric)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary<K> {
	pub key: K,
	pub cases: usize,
	pub metrics: Vec<MetricSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
	pub cases: usize,
	pub completed: usize,
	pub incomplete: usize,
	/// Case inputs that could not be parsed into a case.
	pub rejected: usize,
	pub units_succeeded: usize,
	pub units_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusReport {
	pub generated_at: DateTime<Utc>,
	pub stats: RunStats,
	pub coverage: f64,
	pub metrics: Vec<MetricSummary>,
	pub schools: Vec<GroupSummary<TherapySchool>>,
	pub stages: Vec<GroupSummary<Stage>>,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub composite: Option<f64>,
	/// One data-integrity failure per rejected case input.
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub rejected: Vec<FailureRecord>,
}

impl CorpusReport {
	pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
		self.metrics.iter().find(|m| m.metric == name)
	}
}

/// Everything one evaluation run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRun {
	pub cases: Vec<CaseReport>,
	pub corpus: CorpusReport,
}

impl EvalRun {
	pub fn case(&self, case_id: &str) -> Option<&CaseReport> {
		self.cases.iter().find(|c| c.case_id == case_id)
	}
}
