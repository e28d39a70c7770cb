use std::sync::Arc;

use psyeval_types::{MetricDescriptor, WeightingPolicy};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::MetricConfig;
use crate::metric::Metric;
use crate::metrics::catalogue;
use crate::prompt::{PromptError, PromptLibrary};

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("metric {0:?} is already registered")]
	Duplicate(String),
	#[error("unknown metric {0:?}")]
	Unknown(String),
	#[error("invalid metric {metric:?}: {reason}")]
	InvalidMetric { metric: String, reason: String },
	#[error(transparent)]
	Prompt(#[from] PromptError),
}

/// Registration-time options that shape aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricOptions {
	pub weight: f64,
	pub weighting: WeightingPolicy,
}

impl Default for MetricOptions {
	fn default() -> Self {
		Self { weight: 1.0, weighting: WeightingPolicy::PerCase }
	}
}

impl From<&MetricConfig> for MetricOptions {
	fn from(config: &MetricConfig) -> Self {
		Self { weight: config.weight, weighting: config.weighting }
	}
}

#[derive(Clone)]
pub struct RegisteredMetric {
	pub metric: Arc<dyn Metric>,
	pub options: MetricOptions,
}

/// What the aggregator needs to know about a metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSpec {
	pub descriptor: MetricDescriptor,
	pub options: MetricOptions,
}

/// Ordered, name-unique set of metrics. Read-only once the engine is built.
#[derive(Clone, Default)]
pub struct MetricRegistry {
	entries: Vec<RegisteredMetric>,
}

impl MetricRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(
		&mut self,
		metric: Arc<dyn Metric>,
		options: MetricOptions,
	) -> Result<(), RegistryError> {
		let name = metric.name().to_string();
		if self.get(&name).is_some() {
			return Err(RegistryError::Duplicate(name));
		}
		if !(options.weight.is_finite() && options.weight > 0.0) {
			return Err(RegistryError::InvalidMetric {
				metric: name,
				reason: format!("weight must be positive, got {}", options.weight),
			});
		}
		debug!(metric = %name, granularity = ?metric.granularity(), "registered metric");
		self.entries.push(RegisteredMetric { metric, options });
		Ok(())
	}

	pub fn unregister(&mut self, name: &str) -> Option<RegisteredMetric> {
		let pos = self.entries.iter().position(|e| e.metric.name() == name)?;
		Some(self.entries.remove(pos))
	}

	/// Registration order.
	pub fn list(&self) -> impl Iterator<Item = &RegisteredMetric> {
		self.entries.iter()
	}

	pub fn get(&self, name: &str) -> Option<&RegisteredMetric> {
		self.entries.iter().find(|e| e.metric.name() == name)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn specs(&self) -> Vec<MetricSpec> {
		self.entries
			.iter()
			.map(|e| MetricSpec { descriptor: e.metric.descriptor().clone(), options: e.options })
			.collect()
	}

	/// Builds every enabled metric from the catalogue, in configuration order.
	pub fn from_config(
		configs: &[MetricConfig],
		library: &PromptLibrary,
	) -> Result<Self, RegistryError> {
		let mut registry = Self::new();
		for config in configs.iter().filter(|c| c.enabled) {
			let entry = catalogue::lookup(&config.metric_name)
				.ok_or_else(|| RegistryError::Unknown(config.metric_name.clone()))?;
			let metric = entry.build(config.granularity, library)?;
			registry.register(metric, MetricOptions::from(config))?;
		}
		Ok(registry)
	}
}
