use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde_json::{json, Value};

use super::{JudgeError, JudgeRequest, JudgeService};
use crate::config::JudgeSettings;

/// Judge over an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatService {
	client: Client,
	base_url: String,
	api_key: String,
}

impl OpenAiCompatService {
	pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
		Self {
			client: Client::new(),
			base_url: base_url.into(),
			api_key: api_key.into(),
		}
	}

	pub fn from_settings(settings: &JudgeSettings) -> Self {
		Self::new(settings.base_url.clone(), settings.api_key.clone())
	}

	fn endpoint(&self) -> String {
		format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
	}
}

#[async_trait]
impl JudgeService for OpenAiCompatService {
	async fn complete(&self, request: &JudgeRequest) -> Result<String, JudgeError> {
		let body = request_body(request);

		let resp = self
			.client
			.post(self.endpoint())
			.bearer_auth(&self.api_key)
			.json(&body)
			.send()
			.await
			.map_err(map_transport_error)?;

		let status = resp.status();
		if !status.is_success() {
			let retry_after = resp
				.headers()
				.get(RETRY_AFTER)
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.trim().parse::<u64>().ok())
				.map(Duration::from_secs);
			let text = resp.text().await.unwrap_or_default();
			return Err(classify_status(status.as_u16(), retry_after, text));
		}

		let json: Value = resp
			.json()
			.await
			.map_err(|e| JudgeError::MalformedResponse(e.to_string()))?;
		extract_content(&json)
	}
}

fn request_body(request: &JudgeRequest) -> Value {
	let mut body = json!({
		"model": request.model,
		"messages": [{"role": "user", "content": request.prompt}],
		"temperature": request.temperature,
	});
	if let Some(schema) = &request.response_schema {
		body["response_format"] = json!({
			"type": "json_schema",
			"json_schema": {
				"name": "ScoringReport",
				"strict": false,
				"schema": schema,
			}
		});
	}
	body
}

fn extract_content(json: &Value) -> Result<String, JudgeError> {
	json.pointer("/choices/0/message/content")
		.and_then(|v| v.as_str())
		.map(str::to_string)
		.ok_or_else(|| {
			JudgeError::MalformedResponse("missing choices[0].message.content".to_string())
		})
}

fn map_transport_error(err: reqwest::Error) -> JudgeError {
	if err.is_timeout() {
		JudgeError::Timeout(Duration::ZERO)
	} else if let Some(status) = err.status() {
		classify_status(status.as_u16(), None, err.to_string())
	} else {
		JudgeError::Transport(err.to_string())
	}
}

pub(crate) fn classify_status(
	status: u16,
	retry_after: Option<Duration>,
	message: String,
) -> JudgeError {
	match status {
		429 => JudgeError::RateLimited { retry_after },
		408 => JudgeError::Timeout(Duration::ZERO),
		401 | 403 => JudgeError::Unauthorized(message),
		500..=599 => JudgeError::Server { status, message },
		_ => JudgeError::BadRequest { status, message },
	}
}
