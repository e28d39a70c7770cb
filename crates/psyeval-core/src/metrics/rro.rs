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

pub const ITEMS: i64 = 24;
pub const REVERSED: [i64; 7] = [2, 7, 16, 17, 18, 19, 24];

pub const FACTORS: [(&str, &[i64]); 4] = [
	("client_realism", &[1, 8, 9, 10, 12, 20, 17, 16, 22]),
	("client_genuineness", &[4, 11, 18, 24]),
	("counselor_realism", &[2, 6, 15, 21, 23, 19]),
	("counselor_genuineness", &[3, 5, 7, 13, 14]),
];

const SCALE: RawScale = RawScale::new(1.0, 5.0);

/// Real relationship rating: realism and genuineness on both sides of the dyad.
pub struct Rro {
	descriptor: MetricDescriptor,
	template: PromptTemplate,
	validator: ReplyValidator,
}

impl Rro {
	pub fn load(
		name: &str,
		granularity: Granularity,
		library: &PromptLibrary,
	) -> Result<Self, RegistryError> {
		let template = library.load("RRO", "RRO")?;
		let validator = ReplyValidator::new(items_schema())
			.map_err(|reason| RegistryError::InvalidMetric { metric: name.to_string(), reason })?;
		let names = FACTORS.iter().map(|(n, _)| *n).chain(["client", "counselor"]);
		let shape = OutputShape::subscales(names, 0.0, 10.0);
		Ok(Self {
			descriptor: MetricDescriptor::new(name, granularity, shape),
			template,
			validator,
		})
	}
}

pub fn factor_scores(reply: &ItemsReply) -> Result<BTreeMap<String, f64>, MetricError> {
	let mut items = HashMap::new();
	for entry in &reply.items {
		let number = entry
			.item
			.number()
			.filter(|n| (1..=ITEMS).contains(n))
			.ok_or_else(|| {
				MetricError::Unparsable(format!("unknown RRO item {:?}", entry.item.label()))
			})?;
		let score = SCALE.normalize(entry.score)?;
		let score = if REVERSED.contains(&number) { 10.0 - score } else { score };
		items.insert(number, score);
	}

	let mut out = BTreeMap::new();
	for (factor, numbers) in FACTORS {
		let mut total = 0.0;
		for n in numbers {
			total += items
				.get(n)
				.ok_or_else(|| MetricError::Unparsable(format!("missing RRO item {n}")))?;
		}
		out.insert(factor.to_string(), total / numbers.len() as f64);
	}
	let client = (out["client_realism"] + out["client_genuineness"]) / 2.0;
	let counselor = (out["counselor_realism"] + out["counselor_genuineness"]) / 2.0;
	out.insert("client".to_string(), client);
	out.insert("counselor".to_string(), counselor);
	Ok(out)
}

#[async_trait]
impl Metric for Rro {
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
		let scores = factor_scores(&reply)?;
		Ok(Judgement::new(ScoreValue::Subscales(scores)).with_rationale(reply.rationale))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::metrics::parse::{ItemId, ItemScore};

	fn uniform(score: f64) -> ItemsReply {
		ItemsReply {
			items: (1..=ITEMS)
				.map(|n| ItemScore { item: ItemId::Text(n.to_string()), score })
				.collect(),
			rationale: None,
		}
	}

	#[test]
	fn reversed_items_pull_factors_toward_the_middle() {
		let scores = factor_scores(&uniform(5.0)).unwrap();
		// client realism: 7 direct items at 10, items 16 and 17 reversed to 0
		assert!((scores["client_realism"] - 70.0 / 9.0).abs() < 1e-9);
		// client genuineness: 4 and 11 direct, 18 and 24 reversed
		assert_eq!(scores["client_genuineness"], 5.0);
		assert!((scores["client"] - (70.0 / 9.0 + 5.0) / 2.0).abs() < 1e-9);
		assert_eq!(scores.len(), 6);
	}

	#[test]
	fn incomplete_or_unknown_items_are_unparsable() {
		let mut reply = uniform(3.0);
		reply.items.retain(|i| i.item.number() != Some(13));
		assert!(factor_scores(&reply).unwrap_err().to_string().contains("13"));

		let mut reply = uniform(3.0);
		reply.items.push(ItemScore { item: ItemId::Number(25), score: 3.0 });
		assert!(factor_scores(&reply).is_err());
	}
}
