use async_trait::async_trait;
use psyeval_types::{Granularity, MetricDescriptor, OutputShape, ScoreValue};

use crate::judge::JudgeClient;
use crate::metric::{EvalTarget, Judgement, Metric, MetricError};
use crate::metrics::parse::{label_schema, LabelReply, ReplyValidator};
use crate::metrics::{ask, prompt_vars};
use crate::prompt::{PromptLibrary, PromptTemplate};
use crate::registry::RegistryError;

/// Judge picks exactly one label from a fixed set.
pub struct LabelRubric {
	descriptor: MetricDescriptor,
	template: PromptTemplate,
	validator: ReplyValidator,
}

impl LabelRubric {
	pub fn load(
		name: &str,
		rubric: &str,
		labels: &[&str],
		granularity: Granularity,
		library: &PromptLibrary,
	) -> Result<Self, RegistryError> {
		if labels.is_empty() {
			return Err(RegistryError::InvalidMetric {
				metric: name.to_string(),
				reason: "categorical metric needs at least one label".into(),
			});
		}
		let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
		let template = library.load(rubric, rubric)?;
		let validator = ReplyValidator::new(label_schema(&labels))
			.map_err(|reason| RegistryError::InvalidMetric { metric: name.to_string(), reason })?;
		Ok(Self {
			descriptor: MetricDescriptor::new(name, granularity, OutputShape::categorical(labels)),
			template,
			validator,
		})
	}
}

#[async_trait]
impl Metric for LabelRubric {
	fn descriptor(&self) -> &MetricDescriptor {
		&self.descriptor
	}

	async fn evaluate(
		&self,
		target: EvalTarget<'_>,
		judge: &JudgeClient,
	) -> Result<Judgement, MetricError> {
		let prompt = self.template.render(&prompt_vars(&target));
		let reply: LabelReply = ask(judge, &self.validator, &prompt).await?;
		Ok(Judgement::new(ScoreValue::Category(reply.label)).with_rationale(reply.rationale))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{judge_client, sample_case, ScriptedJudge};
	use crate::walker::CaseWalker;
	use psyeval_types::Stage;
	use std::sync::Arc;

	#[tokio::test]
	async fn session_prompt_carries_stage_and_history() {
		let library = PromptLibrary::in_memory([(
			"stage_alignment",
			"stage_alignment",
			"stage={{stage}}\nhistory={{history}}\n{{diag}}",
		)]);
		let metric = LabelRubric::load(
			"stage_alignment",
			"stage_alignment",
			&["aligned", "partially_aligned", "misaligned"],
			Granularity::PerSession,
			&library,
		)
		.unwrap();
		let service = Arc::new(ScriptedJudge::from_fn(|req| {
			if req.prompt.contains("stage=core_intervention") && req.prompt.contains("[session 1") {
				Ok(r#"{"label": "partially_aligned", "rationale": "drifts back"}"#.into())
			} else {
				Ok(r#"{"label": "misaligned"}"#.into())
			}
		}));
		let judge = judge_client(service, 1);
		let case = sample_case("c1", &[Stage::CaseConceptualization, Stage::CoreIntervention]);
		let (session, context) = CaseWalker::default().walk(&case).unwrap().nth(1).unwrap();

		let target = EvalTarget::Session { case: &case, session, context: &context };
		let judgement = metric.evaluate(target, &judge).await.unwrap();
		assert_eq!(judgement.value, ScoreValue::Category("partially_aligned".into()));
		assert_eq!(judgement.rationale.as_deref(), Some("drifts back"));
	}

	#[tokio::test]
	async fn unknown_label_is_unparsable() {
		let library =
			PromptLibrary::in_memory([("stage_alignment", "stage_alignment", "{{diag}}")]);
		let labels = ["aligned"];
		let metric = LabelRubric::load(
			"stage_alignment",
			"stage_alignment",
			&labels,
			Granularity::PerCase,
			&library,
		)
		.unwrap();
		let judge = judge_client(Arc::new(ScriptedJudge::always(r#"{"label": "excellent"}"#)), 1);
		let case = sample_case("c1", &[Stage::CaseConceptualization]);
		let err = metric.evaluate(EvalTarget::Case(&case), &judge).await.unwrap_err();
		assert!(matches!(err, MetricError::Unparsable(_)));
	}
}
