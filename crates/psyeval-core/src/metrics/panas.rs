use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use psyeval_types::{Granularity, MetricDescriptor, OutputShape, ScoreValue};

use crate::judge::JudgeClient;
use crate::metric::{EvalTarget, Judgement, Metric, MetricError};
use crate::metrics::parse::{items_schema, ItemsReply, ReplyValidator};
use crate::metrics::rubric::RawScale;
use crate::metrics::{ask, prompt_vars};
use crate::prompt::{PromptLibrary, PromptTemplate};
use crate::registry::RegistryError;

pub const POSITIVE: [&str; 10] = [
	"Interested",
	"Excited",
	"Strong",
	"Enthusiastic",
	"Proud",
	"Alert",
	"Inspired",
	"Determined",
	"Attentive",
	"Active",
];

pub const NEGATIVE: [&str; 10] = [
	"Distressed",
	"Upset",
	"Guilty",
	"Scared",
	"Hostile",
	"Irritable",
	"Ashamed",
	"Nervous",
	"Jittery",
	"Afraid",
];

const SCALE: RawScale = RawScale::new(1.0, 5.0);

/// Positive and negative affect of the client plus their 0-10 balance.
pub struct Panas {
	descriptor: MetricDescriptor,
	template: PromptTemplate,
	validator: ReplyValidator,
}

impl Panas {
	pub fn load(
		name: &str,
		granularity: Granularity,
		library: &PromptLibrary,
	) -> Result<Self, RegistryError> {
		let template = library.load("panas", "panas")?;
		let validator = ReplyValidator::new(items_schema())
			.map_err(|reason| RegistryError::InvalidMetric { metric: name.to_string(), reason })?;
		Ok(Self {
			descriptor: MetricDescriptor::new(
				name,
				granularity,
				OutputShape::subscales(["balance", "negative", "positive"], 0.0, 10.0),
			),
			template,
			validator,
		})
	}
}

/// Scores every PANAS item; each one must be present.
pub fn affect_scores(reply: &ItemsReply) -> Result<BTreeMap<String, f64>, MetricError> {
	let lookup: HashMap<String, f64> = reply
		.items
		.iter()
		.map(|i| (i.item.label().to_lowercase(), i.score))
		.collect();

	let mean_of = |items: &[&str]| -> Result<f64, MetricError> {
		let mut total = 0.0;
		for item in items {
			let raw = lookup
				.get(&item.to_lowercase())
				.ok_or_else(|| MetricError::Unparsable(format!("missing PANAS item {item:?}")))?;
			total += SCALE.normalize(*raw)?;
		}
		Ok(total / items.len() as f64)
	};

	let positive = mean_of(&POSITIVE)?;
	let negative = mean_of(&NEGATIVE)?;
	Ok(BTreeMap::from([
		("positive".to_string(), positive),
		("negative".to_string(), negative),
		("balance".to_string(), (positive - negative + 10.0) / 2.0),
	]))
}

#[async_trait]
impl Metric for Panas {
	fn descriptor(&self) -> &MetricDescriptor {
		&self.descriptor
	}

	async fn evaluate(
		&self,
		target: EvalTarget<'_>,
		judge: &JudgeClient,
	) -> Result<Judgement, MetricError> {
		let prompt = self.template.render(&prompt_vars(&target));
		let reply: ItemsReply = ask(judge, &self.validator, &prompt).await?;
		let scores = affect_scores(&reply)?;
		Ok(Judgement::new(ScoreValue::Subscales(scores)).with_rationale(reply.rationale))
	}
}
