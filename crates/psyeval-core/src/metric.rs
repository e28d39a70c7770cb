use async_trait::async_trait;
use psyeval_types::{Case, FailureKind, Granularity, MetricDescriptor, ScoreValue, Session, Target};
use thiserror::Error;

use crate::judge::{JudgeClient, JudgeError};
use crate::walker::SessionContext;

/// What a metric is asked to evaluate. Borrowed read-only from the engine.
#[derive(Debug, Clone, Copy)]
pub enum EvalTarget<'a> {
	Case(&'a Case),
	Session {
		case: &'a Case,
		session: &'a Session,
		context: &'a SessionContext,
	},
}

impl<'a> EvalTarget<'a> {
	pub fn case(&self) -> &'a Case {
		match self {
			EvalTarget::Case(case) | EvalTarget::Session { case, .. } => case,
		}
	}

	pub fn target(&self) -> Target {
		match self {
			EvalTarget::Case(_) => Target::Case,
			EvalTarget::Session { session, .. } => Target::Session(session.index),
		}
	}
}

/// A metric's answer for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
	pub value: ScoreValue,
	pub rationale: Option<String>,
}

impl Judgement {
	pub fn new(value: ScoreValue) -> Self {
		Self { value, rationale: None }
	}

	pub fn with_rationale(mut self, rationale: Option<String>) -> Self {
		self.rationale = rationale;
		self
	}
}

#[derive(Debug, Error)]
pub enum MetricError {
	#[error(transparent)]
	Judge(#[from] JudgeError),
	#[error("unparsable judge result: {0}")]
	Unparsable(String),
	#[error("invalid target: {0}")]
	InvalidTarget(String),
}

impl MetricError {
	pub fn kind(&self) -> FailureKind {
		match self {
			// The judge answered, but with a body that carries no reply text.
			MetricError::Judge(JudgeError::MalformedResponse(_)) => FailureKind::UnparsableResult,
			MetricError::Judge(JudgeError::Rejected(inner))
				if matches!(**inner, JudgeError::MalformedResponse(_)) =>
			{
				FailureKind::UnparsableResult
			}
			MetricError::Judge(JudgeError::Rejected(_)) => FailureKind::JudgeRejected,
			MetricError::Judge(e)
				if !e.is_transient() && !matches!(e, JudgeError::Unavailable { .. }) =>
			{
				FailureKind::JudgeRejected
			}
			MetricError::Judge(_) => FailureKind::JudgeUnavailable,
			MetricError::Unparsable(_) => FailureKind::UnparsableResult,
			MetricError::InvalidTarget(_) => FailureKind::InvalidTarget,
		}
	}
}

/// One pluggable scoring rubric.
///
/// `evaluate` may only depend on its arguments; concurrent calls share no
/// mutable state.
#[async_trait]
pub trait Metric: Send + Sync {
	fn descriptor(&self) -> &MetricDescriptor;

	async fn evaluate(
		&self,
		target: EvalTarget<'_>,
		judge: &JudgeClient,
	) -> Result<Judgement, MetricError>;

	fn name(&self) -> &str {
		&self.descriptor().name
	}

	fn granularity(&self) -> Granularity {
		self.descriptor().granularity
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn judge_errors_map_to_failure_kinds() {
		let unavailable = MetricError::Judge(JudgeError::Unavailable {
			attempts: 3,
			last: Box::new(JudgeError::Timeout(Duration::from_secs(1))),
		});
		assert_eq!(unavailable.kind(), FailureKind::JudgeUnavailable);

		let unauthorized = JudgeError::Unauthorized("key".into());
		let rejected = MetricError::Judge(JudgeError::Rejected(Box::new(unauthorized)));
		assert_eq!(rejected.kind(), FailureKind::JudgeRejected);

		assert_eq!(MetricError::Unparsable("x".into()).kind(), FailureKind::UnparsableResult);

		let empty_reply = JudgeError::MalformedResponse("missing message content".into());
		let wrapped = MetricError::Judge(JudgeError::Rejected(Box::new(empty_reply.clone())));
		assert_eq!(wrapped.kind(), FailureKind::UnparsableResult);
		assert_eq!(MetricError::Judge(empty_reply).kind(), FailureKind::UnparsableResult);
		assert_eq!(MetricError::InvalidTarget("x".into()).kind(), FailureKind::InvalidTarget);
	}
}
