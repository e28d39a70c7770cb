//! Judge client: one text-completion call with retry, backoff and a
//! system-wide in-flight permit pool.

pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One request to the judge service.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest {
	pub prompt: String,
	pub model: String,
	pub temperature: f32,
	/// JSON schema the reply should follow, when the service supports structured output.
	pub response_schema: Option<Value>,
}

#[derive(Debug, Clone, Error)]
pub enum JudgeError {
	#[error("judge call timed out after {0:?}")]
	Timeout(Duration),
	#[error("judge rate limited the request")]
	RateLimited { retry_after: Option<Duration> },
	#[error("judge server error (status {status}): {message}")]
	Server { status: u16, message: String },
	#[error("judge transport error: {0}")]
	Transport(String),
	#[error("judge rejected the request (status {status}): {message}")]
	BadRequest { status: u16, message: String },
	#[error("judge authentication failed: {0}")]
	Unauthorized(String),
	#[error("malformed judge response: {0}")]
	MalformedResponse(String),
	#[error("judge unavailable after {attempts} attempt(s): {last}")]
	Unavailable { attempts: u32, last: Box<JudgeError> },
	#[error("judge rejected the call: {0}")]
	Rejected(Box<JudgeError>),
}

impl JudgeError {
	/// Transient errors are worth another attempt.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			JudgeError::Timeout(_)
				| JudgeError::RateLimited { .. }
				| JudgeError::Server { .. }
				| JudgeError::Transport(_)
		)
	}
}

/// Transport boundary: `complete(prompt, model, temperature) -> text`.
#[async_trait]
pub trait JudgeService: Send + Sync {
	async fn complete(&self, request: &JudgeRequest) -> Result<String, JudgeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	/// Upper bound on the summed backoff sleeps of one `complete` call.
	pub max_total_wait: Duration,
	pub call_timeout: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 6,
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(60),
			max_total_wait: Duration::from_secs(300),
			call_timeout: Duration::from_secs(300),
		}
	}
}

impl RetryPolicy {
	/// Delay before the attempt following `attempt` (1-based) that failed with `err`.
	pub fn backoff(&self, attempt: u32, err: &JudgeError) -> Duration {
		let mut rng = rand::thread_rng();
		match err {
			JudgeError::RateLimited { retry_after: Some(retry_after) } => {
				let base_ms = (*retry_after).min(self.max_delay).as_millis() as f64;
				let jitter: f64 = rng.gen_range(0.9_f64..=1.1_f64);
				Duration::from_millis((base_ms * jitter).round() as u64)
			}
			_ => {
				let exp = self
					.base_delay
					.checked_mul(1u32 << attempt.saturating_sub(1).min(16))
					.unwrap_or(self.max_delay)
					.min(self.max_delay);
				let upper = exp.as_millis() as u64;
				Duration::from_millis(rng.gen_range(0..=upper).max(1))
			}
		}
	}
}

/// Cloneable handle to a judge service; clones share the permit pool.
#[derive(Clone)]
pub struct JudgeClient {
	service: Arc<dyn JudgeService>,
	permits: Arc<Semaphore>,
	max_in_flight: usize,
	policy: RetryPolicy,
	model: String,
	temperature: f32,
}

impl JudgeClient {
	pub fn new(
		service: Arc<dyn JudgeService>,
		model: impl Into<String>,
		temperature: f32,
		policy: RetryPolicy,
		max_in_flight: usize,
	) -> Self {
		let max_in_flight = max_in_flight.max(1);
		Self {
			service,
			permits: Arc::new(Semaphore::new(max_in_flight)),
			max_in_flight,
			policy,
			model: model.into(),
			temperature,
		}
	}

	pub fn model(&self) -> &str {
		&self.model
	}

	pub fn policy(&self) -> &RetryPolicy {
		&self.policy
	}

	pub fn max_in_flight(&self) -> usize {
		self.max_in_flight
	}

	/// Calls currently holding a permit.
	pub fn in_flight(&self) -> usize {
		self.max_in_flight - self.permits.available_permits()
	}

	pub async fn complete(&self, prompt: &str) -> Result<String, JudgeError> {
		self.complete_structured(prompt, None).await
	}

	/// Completes `prompt`, asking for a reply that follows `schema`.
	///
	/// Only `Unavailable` and `Rejected` are returned as errors.
	pub async fn complete_structured(
		&self,
		prompt: &str,
		schema: Option<&Value>,
	) -> Result<String, JudgeError> {
		let request = JudgeRequest {
			prompt: prompt.to_string(),
			model: self.model.clone(),
			temperature: self.temperature,
			response_schema: schema.cloned(),
		};

		let max_attempts = self.policy.max_attempts.max(1);
		let mut attempt = 0u32;
		let mut waited = Duration::ZERO;
		loop {
			attempt += 1;
			let err = match self.attempt(&request).await {
				Ok(text) => {
					debug!(attempt, model = %self.model, "judge call succeeded");
					return Ok(text);
				}
				Err(err) => err,
			};

			if !err.is_transient() {
				warn!(error = %err, attempt, "judge call rejected");
				return Err(JudgeError::Rejected(Box::new(err)));
			}
			if attempt >= max_attempts {
				warn!(error = %err, attempts = attempt, "judge retries exhausted");
				return Err(JudgeError::Unavailable { attempts: attempt, last: Box::new(err) });
			}

			let delay = self.policy.backoff(attempt, &err);
			if waited + delay > self.policy.max_total_wait {
				warn!(
					error = %err,
					attempts = attempt,
					waited_ms = waited.as_millis() as u64,
					"judge backoff budget exhausted"
				);
				return Err(JudgeError::Unavailable { attempts: attempt, last: Box::new(err) });
			}

			warn!(
				error = %err,
				retry = attempt,
				max_attempts,
				backoff_ms = delay.as_millis() as u64,
				"retrying judge call"
			);
			tokio::time::sleep(delay).await;
			waited += delay;
		}
	}

	async fn attempt(&self, request: &JudgeRequest) -> Result<String, JudgeError> {
		// The permit is held for the request only, never across a backoff sleep.
		let _permit = self
			.permits
			.acquire()
			.await
			.map_err(|_| JudgeError::Transport("judge permit pool closed".to_string()))?;
		match tokio::time::timeout(self.policy.call_timeout, self.service.complete(request)).await {
			Ok(result) => result,
			Err(_) => Err(JudgeError::Timeout(self.policy.call_timeout)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{fast_retry_policy, ScriptedJudge};
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn client(service: Arc<ScriptedJudge>, attempts: u32) -> JudgeClient {
		JudgeClient::new(service, "judge-model", 0.0, fast_retry_policy(attempts), 4)
	}

	#[tokio::test]
	async fn always_timing_out_service_is_tried_exactly_max_attempts() {
		let service = Arc::new(ScriptedJudge::from_fn(|_| {
			Err(JudgeError::Timeout(Duration::from_secs(1)))
		}));
		let judge = client(service.clone(), 3);

		let err = judge.complete("rate this").await.unwrap_err();
		assert_eq!(service.calls(), 3);
		match err {
			JudgeError::Unavailable { attempts, last } => {
				assert_eq!(attempts, 3);
				assert!(matches!(*last, JudgeError::Timeout(_)));
			}
			other => panic!("expected unavailable, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn non_transient_errors_are_not_retried() {
		let service = Arc::new(ScriptedJudge::from_fn(|_| {
			Err(JudgeError::Unauthorized("bad key".into()))
		}));
		let judge = client(service.clone(), 5);

		let err = judge.complete("rate this").await.unwrap_err();
		assert_eq!(service.calls(), 1);
		assert!(matches!(err, JudgeError::Rejected(_)));
	}

	#[tokio::test]
	async fn transient_failure_then_success_returns_text() {
		let seen = Arc::new(AtomicUsize::new(0));
		let counter = seen.clone();
		let service = Arc::new(ScriptedJudge::from_fn(move |_| {
			if counter.fetch_add(1, Ordering::SeqCst) == 0 {
				Err(JudgeError::Server { status: 503, message: "busy".into() })
			} else {
				Ok("{\"items\": []}".to_string())
			}
		}));
		let judge = client(service.clone(), 3);

		assert_eq!(judge.complete("rate this").await.unwrap(), "{\"items\": []}");
		assert_eq!(service.calls(), 2);
	}

	#[tokio::test]
	async fn slow_service_hits_the_call_timeout() {
		let service =
			Arc::new(ScriptedJudge::always("late").with_delay(Duration::from_millis(200)));
		let mut policy = fast_retry_policy(2);
		policy.call_timeout = Duration::from_millis(10);
		let judge = JudgeClient::new(service.clone(), "m", 0.0, policy, 1);

		let err = judge.complete("rate this").await.unwrap_err();
		assert!(matches!(err, JudgeError::Unavailable { attempts: 2, .. }));
	}

	#[tokio::test]
	async fn total_wait_budget_stops_retries_early() {
		let service = Arc::new(ScriptedJudge::from_fn(|_| {
			Err(JudgeError::RateLimited { retry_after: Some(Duration::from_millis(50)) })
		}));
		let mut policy = fast_retry_policy(10);
		policy.max_delay = Duration::from_millis(50);
		policy.max_total_wait = Duration::from_millis(20);
		let judge = JudgeClient::new(service.clone(), "m", 0.0, policy, 1);

		let err = judge.complete("rate this").await.unwrap_err();
		assert!(matches!(err, JudgeError::Unavailable { attempts: 1, .. }));
		assert_eq!(service.calls(), 1);
	}

	#[tokio::test]
	async fn in_flight_calls_never_exceed_the_permit_pool() {
		let service = Arc::new(ScriptedJudge::always("ok").with_delay(Duration::from_millis(20)));
		let judge = JudgeClient::new(service.clone(), "m", 0.0, fast_retry_policy(1), 2);

		let calls = (0..6).map(|_| judge.complete("p"));
		let results = futures::future::join_all(calls).await;
		assert!(results.iter().all(|r| r.is_ok()));
		assert_eq!(service.max_concurrent(), 2);
	}

	#[test]
	fn exponential_backoff_is_capped() {
		let policy = RetryPolicy {
			max_attempts: 10,
			base_delay: Duration::from_millis(100),
			max_delay: Duration::from_millis(400),
			max_total_wait: Duration::from_secs(10),
			call_timeout: Duration::from_secs(1),
		};
		let err = JudgeError::Timeout(Duration::from_secs(1));
		for attempt in 1..10 {
			assert!(policy.backoff(attempt, &err) <= Duration::from_millis(400));
		}
	}

	#[test]
	fn retry_after_is_honoured_with_jitter() {
		let policy = RetryPolicy::default();
		let err = JudgeError::RateLimited { retry_after: Some(Duration::from_secs(2)) };
		let delay = policy.backoff(1, &err);
		assert!(delay >= Duration::from_millis(1800) && delay <= Duration::from_millis(2200));
	}
}
