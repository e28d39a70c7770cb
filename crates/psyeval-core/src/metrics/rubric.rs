//! Likert-item rubrics: one judge call per criterion, every returned item
//! normalised to 0-10, the metric value is the mean over all items.

use async_trait::async_trait;
use futures::future::try_join_all;
use psyeval_types::{Granularity, MetricDescriptor, OutputShape, ScoreValue};

use crate::judge::JudgeClient;
use crate::metric::{EvalTarget, Judgement, Metric, MetricError};
use crate::metrics::parse::{items_schema, ItemsReply, ReplyValidator};
use crate::metrics::{ask, prompt_vars};
use crate::prompt::{PromptLibrary, PromptTemplate};
use crate::registry::RegistryError;

/// Raw answer range of a rubric, mapped linearly onto 0-10.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawScale {
	pub min: f64,
	pub max: f64,
}

impl RawScale {
	pub const fn new(min: f64, max: f64) -> Self {
		Self { min, max }
	}

	pub fn normalize(&self, raw: f64) -> Result<f64, MetricError> {
		if !raw.is_finite() || raw < self.min || raw > self.max {
			return Err(MetricError::Unparsable(format!(
				"score {raw} is outside the rubric range [{}, {}]",
				self.min, self.max
			)));
		}
		Ok((raw - self.min) / (self.max - self.min) * 10.0)
	}
}

#[derive(Debug, Clone)]
pub struct Criterion {
	pub key: String,
	template: PromptTemplate,
}

pub struct ItemRubric {
	descriptor: MetricDescriptor,
	scale: RawScale,
	criteria: Vec<Criterion>,
	validator: ReplyValidator,
}

impl ItemRubric {
	/// Loads one prompt per criterion from `<rubric>/<criterion>`.
	pub fn load(
		name: &str,
		rubric: &str,
		criteria: &[&str],
		scale: RawScale,
		granularity: Granularity,
		library: &PromptLibrary,
	) -> Result<Self, RegistryError> {
		if criteria.is_empty() {
			return Err(RegistryError::InvalidMetric {
				metric: name.to_string(),
				reason: "rubric has no criteria".into(),
			});
		}
		if !(scale.max > scale.min) {
			return Err(RegistryError::InvalidMetric {
				metric: name.to_string(),
				reason: format!("empty raw scale [{}, {}]", scale.min, scale.max),
			});
		}
		let criteria = criteria
			.iter()
			.map(|key| {
				Ok(Criterion {
					key: key.to_string(),
					template: library.load(rubric, key)?,
				})
			})
			.collect::<Result<Vec<_>, RegistryError>>()?;
		let validator = ReplyValidator::new(items_schema())
			.map_err(|reason| RegistryError::InvalidMetric { metric: name.to_string(), reason })?;

		Ok(Self {
			descriptor: MetricDescriptor::new(name, granularity, OutputShape::scalar(0.0, 10.0)),
			scale,
			criteria,
			validator,
		})
	}

	pub fn criteria(&self) -> impl Iterator<Item = &str> {
		self.criteria.iter().map(|c| c.key.as_str())
	}
}

#[async_trait]
impl Metric for ItemRubric {
	fn descriptor(&self) -> &MetricDescriptor {
		&self.descriptor
	}

	async fn evaluate(
		&self,
		target: EvalTarget<'_>,
		judge: &JudgeClient,
	) -> Result<Judgement, MetricError> {
		let vars = prompt_vars(&target);
		let replies = try_join_all(self.criteria.iter().map(|criterion| {
			let prompt = criterion.template.render(&vars);
			async move {
				let reply: ItemsReply = ask(judge, &self.validator, &prompt).await?;
				Ok::<_, MetricError>((criterion.key.as_str(), reply))
			}
		}))
		.await?;

		let mut total = 0.0;
		let mut count = 0usize;
		let mut notes = Vec::new();
		for (key, reply) in &replies {
			for item in &reply.items {
				total += self.scale.normalize(item.score)?;
				count += 1;
			}
			if let Some(r) = reply.rationale.as_deref().filter(|r| !r.trim().is_empty()) {
				notes.push(format!("{key}: {}", r.trim()));
			}
		}
		if count == 0 {
			return Err(MetricError::Unparsable("judge returned no item scores".into()));
		}

		let rationale = (!notes.is_empty()).then(|| notes.join("\n"));
		Ok(Judgement::new(ScoreValue::Scalar(total / count as f64)).with_rationale(rationale))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{judge_client, sample_case, ScriptedJudge};
	use psyeval_types::Stage;
	use std::sync::Arc;

	fn library() -> PromptLibrary {
		PromptLibrary::in_memory([
			("miti", "empathy", "EMPATHY {{diag}}"),
			("miti", "partnership", "PARTNERSHIP {{diag}}"),
		])
	}

	#[test]
	fn raw_scales_map_onto_ten_points() {
		assert_eq!(RawScale::new(1.0, 5.0).normalize(3.0).unwrap(), 5.0);
		assert_eq!(RawScale::new(0.0, 6.0).normalize(6.0).unwrap(), 10.0);
		assert_eq!(RawScale::new(1.0, 7.0).normalize(1.0).unwrap(), 0.0);
		assert!(RawScale::new(0.0, 2.0).normalize(3.0).is_err());
	}

	#[test]
	fn missing_criterion_prompt_fails_registration() {
		let err = ItemRubric::load(
			"MITI",
			"miti",
			&["empathy", "cultivating change talk"],
			RawScale::new(1.0, 5.0),
			Granularity::PerSession,
			&library(),
		)
		.err()
		.unwrap();
		assert!(matches!(err, RegistryError::Prompt(_)));
	}

	#[tokio::test]
	async fn items_from_all_criteria_are_averaged() {
		let rubric = ItemRubric::load(
			"MITI",
			"miti",
			&["empathy", "partnership"],
			RawScale::new(1.0, 5.0),
			Granularity::PerCase,
			&library(),
		)
		.unwrap();
		let service = Arc::new(ScriptedJudge::from_fn(|req| {
			if req.prompt.starts_with("EMPATHY") {
				Ok(r#"{"items": [{"item": "empathy", "score": 5}], "rationale": "reflective"}"#.into())
			} else {
				Ok("```json\n{\"items\": [{\"item\": \"a\", \"score\": 1}, {\"item\": \"b\", \"score\": 3}]}\n```".into())
			}
		}));
		let judge = judge_client(service.clone(), 2);
		let case = sample_case("c1", &[Stage::CaseConceptualization]);

		let judgement = rubric.evaluate(EvalTarget::Case(&case), &judge).await.unwrap();
		// (10 + 0 + 5) / 3
		assert_eq!(judgement.value, ScoreValue::Scalar(5.0));
		assert_eq!(judgement.rationale.as_deref(), Some("empathy: reflective"));
		assert_eq!(service.calls(), 2);
	}

	#[tokio::test]
	async fn out_of_range_item_is_unparsable() {
		let rubric = ItemRubric::load(
			"MITI",
			"miti",
			&["empathy"],
			RawScale::new(1.0, 5.0),
			Granularity::PerCase,
			&library(),
		)
		.unwrap();
		let reply = r#"{"items": [{"item": "x", "score": 9}]}"#;
		let judge = judge_client(Arc::new(ScriptedJudge::always(reply)), 2);
		let case = sample_case("c1", &[Stage::CaseConceptualization]);
		let err = rubric.evaluate(EvalTarget::Case(&case), &judge).await.unwrap_err();
		assert!(matches!(err, MetricError::Unparsable(_)));
	}
}
