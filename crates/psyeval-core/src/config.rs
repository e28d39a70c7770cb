use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use psyeval_types::{Granularity, WeightingPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::judge::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("environment variable {0} is not set")]
	MissingEnv(&'static str),
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Judge endpoint settings, read once at startup and passed explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeSettings {
	pub base_url: String,
	pub api_key: String,
	pub model: String,
	pub temperature: f32,
}

impl JudgeSettings {
	pub const BASE_URL_VAR: &'static str = "CHAT_API_BASE";
	pub const API_KEY_VAR: &'static str = "CHAT_API_KEY";
	pub const MODEL_VAR: &'static str = "CHAT_MODEL_NAME";

	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Builds settings from an arbitrary variable lookup; empty values count as unset.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let get = |key: &'static str| {
			lookup(key)
				.filter(|v| !v.trim().is_empty())
				.ok_or(ConfigError::MissingEnv(key))
		};
		Ok(Self {
			base_url: get(Self::BASE_URL_VAR)?,
			api_key: get(Self::API_KEY_VAR)?,
			model: get(Self::MODEL_VAR)?,
			temperature: 0.0,
		})
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
	pub data: DataConfig,
	#[serde(default = "default_prompts_dir")]
	pub prompts_dir: PathBuf,
	#[serde(default)]
	pub metrics: Vec<MetricConfig>,
	#[serde(default)]
	pub engine: EngineConfig,
	#[serde(default)]
	pub judge: JudgeConfig,
}

fn default_prompts_dir() -> PathBuf {
	PathBuf::from("prompts")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
	/// A JSONL file or a directory of `*.json` case files.
	pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
	pub metric_name: String,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	#[serde(default = "default_weight")]
	pub weight: f64,
	#[serde(default)]
	pub weighting: WeightingPolicy,
	/// Overrides the catalogue's granularity for this metric.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub granularity: Option<Granularity>,
}

impl MetricConfig {
	pub fn new(metric_name: impl Into<String>) -> Self {
		Self {
			metric_name: metric_name.into(),
			enabled: true,
			weight: default_weight(),
			weighting: WeightingPolicy::default(),
			granularity: None,
		}
	}
}

fn default_enabled() -> bool {
	true
}

fn default_weight() -> f64 {
	1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
	#[serde(default = "default_case_concurrency")]
	pub case_concurrency: usize,
	#[serde(default = "default_unit_concurrency")]
	pub unit_concurrency: usize,
	#[serde(default)]
	pub case_timeout_secs: Option<u64>,
	/// Number of prior sessions summarised in each session's context.
	#[serde(default = "default_context_window")]
	pub context_window: usize,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			case_concurrency: default_case_concurrency(),
			unit_concurrency: default_unit_concurrency(),
			case_timeout_secs: None,
			context_window: default_context_window(),
		}
	}
}

impl EngineConfig {
	pub fn case_timeout(&self) -> Option<Duration> {
		self.case_timeout_secs.map(Duration::from_secs)
	}
}

fn default_case_concurrency() -> usize {
	4
}

fn default_unit_concurrency() -> usize {
	32
}

fn default_context_window() -> usize {
	3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
	/// Takes precedence over `CHAT_MODEL_NAME`.
	#[serde(default)]
	pub model: Option<String>,
	#[serde(default)]
	pub temperature: f32,
	#[serde(default)]
	pub retry: RetryConfig,
}

impl Default for JudgeConfig {
	fn default() -> Self {
		Self {
			model: None,
			temperature: 0.0,
			retry: RetryConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	#[serde(default = "default_base_delay_ms")]
	pub base_delay_ms: u64,
	#[serde(default = "default_max_delay_ms")]
	pub max_delay_ms: u64,
	#[serde(default = "default_max_total_wait_ms")]
	pub max_total_wait_ms: u64,
	#[serde(default = "default_call_timeout_ms")]
	pub call_timeout_ms: u64,
	#[serde(default = "default_max_in_flight")]
	pub max_in_flight: usize,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: default_max_attempts(),
			base_delay_ms: default_base_delay_ms(),
			max_delay_ms: default_max_delay_ms(),
			max_total_wait_ms: default_max_total_wait_ms(),
			call_timeout_ms: default_call_timeout_ms(),
			max_in_flight: default_max_in_flight(),
		}
	}
}

impl RetryConfig {
	pub fn policy(&self) -> RetryPolicy {
		RetryPolicy {
			max_attempts: self.max_attempts,
			base_delay: Duration::from_millis(self.base_delay_ms),
			max_delay: Duration::from_millis(self.max_delay_ms),
			max_total_wait: Duration::from_millis(self.max_total_wait_ms),
			call_timeout: Duration::from_millis(self.call_timeout_ms),
		}
	}
}

fn default_max_attempts() -> u32 {
	6
}

fn default_base_delay_ms() -> u64 {
	1_000
}

fn default_max_delay_ms() -> u64 {
	60_000
}

fn default_max_total_wait_ms() -> u64 {
	300_000
}

fn default_call_timeout_ms() -> u64 {
	300_000
}

fn default_max_in_flight() -> usize {
	16
}

impl EvalConfig {
	pub fn from_yaml_str(s: &str) -> Result<Self> {
		let config: Self = serde_yaml::from_str(s).context("Invalid evaluation config YAML")?;
		config.validate()?;
		Ok(config)
	}

	pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let content = tokio::fs::read_to_string(path)
			.await
			.with_context(|| format!("Failed to read {:?}", path))?;
		Self::from_yaml_str(&content).with_context(|| format!("Failed to load config {:?}", path))
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let retry = &self.judge.retry;
		if retry.max_attempts == 0 {
			return Err(ConfigError::Invalid("judge.retry.max_attempts must be at least 1".into()));
		}
		if retry.max_in_flight == 0 {
			return Err(ConfigError::Invalid("judge.retry.max_in_flight must be at least 1".into()));
		}
		if retry.base_delay_ms > retry.max_delay_ms {
			return Err(ConfigError::Invalid(
				"judge.retry.base_delay_ms exceeds max_delay_ms".into(),
			));
		}
		if self.engine.case_concurrency == 0 || self.engine.unit_concurrency == 0 {
			return Err(ConfigError::Invalid("engine concurrency limits must be at least 1".into()));
		}
		for m in &self.metrics {
			if !(m.weight.is_finite() && m.weight > 0.0) {
				return Err(ConfigError::Invalid(format!(
					"metric {} has non-positive weight {}",
					m.metric_name, m.weight
				)));
			}
		}
		Ok(())
	}

	pub fn enabled_metrics(&self) -> impl Iterator<Item = &MetricConfig> {
		self.metrics.iter().filter(|m| m.enabled)
	}
}
