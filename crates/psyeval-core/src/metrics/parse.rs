use std::sync::OnceLock;

use jsonschema::JSONSchema;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::metric::MetricError;
use crate::prompt::strip_think_blocks;

fn fence_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("static regex"))
}

/// Drops reasoning blocks and unwraps a fenced code block if present.
pub fn clean_reply(raw: &str) -> String {
	let text = strip_think_blocks(raw);
	match fence_re().captures(&text) {
		Some(caps) => caps[1].trim().to_string(),
		None => text.trim().to_string(),
	}
}

/// `{"items": [{"item", "score"}], "rationale"?}`.
pub fn items_schema() -> Value {
	json!({
		"type": "object",
		"properties": {
			"items": {
				"type": "array",
				"minItems": 1,
				"items": {
					"type": "object",
					"properties": {
						"item": { "type": ["string", "integer"] },
						"score": { "type": "number" }
					},
					"required": ["item", "score"]
				}
			},
			"rationale": { "type": "string" }
		},
		"required": ["items"]
	})
}

/// `{"label": <one of labels>, "rationale"?}`.
pub fn label_schema(labels: &[String]) -> Value {
	json!({
		"type": "object",
		"properties": {
			"label": { "type": "string", "enum": labels },
			"rationale": { "type": "string" }
		},
		"required": ["label"]
	})
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
	Number(i64),
	Text(String),
}

impl ItemId {
	pub fn number(&self) -> Option<i64> {
		match self {
			ItemId::Number(n) => Some(*n),
			ItemId::Text(s) => s.trim().parse().ok(),
		}
	}

	pub fn label(&self) -> String {
		match self {
			ItemId::Number(n) => n.to_string(),
			ItemId::Text(s) => s.trim().to_string(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemScore {
	pub item: ItemId,
	pub score: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemsReply {
	pub items: Vec<ItemScore>,
	#[serde(default)]
	pub rationale: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelReply {
	pub label: String,
	#[serde(default)]
	pub rationale: Option<String>,
}

/// Compiled reply schema; the same schema is sent to the judge.
pub struct ReplyValidator {
	schema: Value,
	compiled: JSONSchema,
}

impl ReplyValidator {
	pub fn new(schema: Value) -> Result<Self, String> {
		let compiled =
			JSONSchema::compile(&schema).map_err(|e| format!("Invalid reply schema: {}", e))?;
		Ok(Self { schema, compiled })
	}

	pub fn schema(&self) -> &Value {
		&self.schema
	}

	pub fn parse<T: DeserializeOwned>(&self, raw: &str) -> Result<T, MetricError> {
		let text = clean_reply(raw);
		let value: Value = serde_json::from_str(&text).map_err(|e| {
			MetricError::Unparsable(format!("reply is not JSON ({e}): {}", preview(&text)))
		})?;

		if let Err(errors) = self.compiled.validate(&value) {
			let messages: Vec<String> =
				errors.map(|e| format!("{}: {}", e.instance_path, e)).collect();
			return Err(MetricError::Unparsable(format!(
				"reply does not match schema: {}",
				messages.join("; ")
			)));
		}

		serde_json::from_value(value).map_err(|e| MetricError::Unparsable(e.to_string()))
	}
}

fn preview(text: &str) -> String {
	let mut out: String = text.chars().take(120).collect();
	if text.chars().count() > 120 {
		out.push('…');
	}
	out
}
