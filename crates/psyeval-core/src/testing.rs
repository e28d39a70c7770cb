//! Deterministic judges, fixture cases and run assertions for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use psyeval_types::{
	Case, EvalRun, Granularity, MetricDescriptor, OutputShape, ScoreValue, Session, Stage,
	TherapySchool, Turn,
};

use crate::judge::{JudgeClient, JudgeError, JudgeRequest, JudgeService, RetryPolicy};
use crate::metric::{EvalTarget, Judgement, Metric, MetricError};

type Handler = Box<dyn Fn(&JudgeRequest) -> Result<String, JudgeError> + Send + Sync>;

/// In-memory judge answering from a closure.
pub struct ScriptedJudge {
	handler: Handler,
	delay: Option<Duration>,
	calls: AtomicUsize,
	current: Arc<AtomicUsize>,
	peak: AtomicUsize,
}

impl ScriptedJudge {
	pub fn from_fn<F>(handler: F) -> Self
	where
		F: Fn(&JudgeRequest) -> Result<String, JudgeError> + Send + Sync + 'static,
	{
		Self {
			handler: Box::new(handler),
			delay: None,
			calls: AtomicUsize::new(0),
			current: Arc::new(AtomicUsize::new(0)),
			peak: AtomicUsize::new(0),
		}
	}

	pub fn always(reply: impl Into<String>) -> Self {
		let reply = reply.into();
		Self::from_fn(move |_| Ok(reply.clone()))
	}

	/// Every call sleeps this long before answering.
	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);
		self
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	/// Highest number of calls observed in flight at once.
	pub fn max_concurrent(&self) -> usize {
		self.peak.load(Ordering::SeqCst)
	}
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl JudgeService for ScriptedJudge {
	async fn complete(&self, request: &JudgeRequest) -> Result<String, JudgeError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
		let _guard = InFlight(self.current.clone());
		self.peak.fetch_max(now, Ordering::SeqCst);
		if let Some(delay) = self.delay {
			tokio::time::sleep(delay).await;
		}
		(self.handler)(request)
	}
}

/// Millisecond backoff so retry tests stay fast.
pub fn fast_retry_policy(max_attempts: u32) -> RetryPolicy {
	RetryPolicy {
		max_attempts,
		base_delay: Duration::from_millis(1),
		max_delay: Duration::from_millis(2),
		max_total_wait: Duration::from_secs(1),
		call_timeout: Duration::from_secs(1),
	}
}

pub fn judge_client(service: Arc<ScriptedJudge>, max_attempts: u32) -> JudgeClient {
	JudgeClient::new(service, "scripted-judge", 0.0, fast_retry_policy(max_attempts), 8)
}

/// A CBT case with one short session per stage label, indexed from 1.
pub fn sample_case(id: &str, stages: &[Stage]) -> Case {
	let sessions = stages
		.iter()
		.enumerate()
		.map(|(i, stage)| {
			let n = i + 1;
			Session::new(
				n as u32,
				*stage,
				vec![
					Turn::counselor(format!("How have things been since last time? (session {n})")),
					Turn::client(format!("I kept worrying about work before session {n}.")),
					Turn::counselor("What went through your mind when that happened?"),
					Turn::client(format!("That I would fail again. ({n})")),
				],
			)
		})
		.collect();
	Case::new(id, TherapySchool::Cbt, sessions)
}

type EvalFn = Box<dyn Fn(EvalTarget<'_>) -> Result<Judgement, MetricError> + Send + Sync>;

/// Metric computed by a closure, with no judge call.
pub struct FnMetric {
	descriptor: MetricDescriptor,
	eval: EvalFn,
}

impl FnMetric {
	pub fn new<F>(descriptor: MetricDescriptor, eval: F) -> Arc<dyn Metric>
	where
		F: Fn(EvalTarget<'_>) -> Result<Judgement, MetricError> + Send + Sync + 'static,
	{
		Arc::new(Self { descriptor, eval: Box::new(eval) })
	}
}

#[async_trait]
impl Metric for FnMetric {
	fn descriptor(&self) -> &MetricDescriptor {
		&self.descriptor
	}

	async fn evaluate(
		&self,
		target: EvalTarget<'_>,
		_judge: &JudgeClient,
	) -> Result<Judgement, MetricError> {
		(self.eval)(target)
	}
}

/// Scalar metric that always returns the same value.
pub struct ConstMetric;

impl ConstMetric {
	pub fn scalar(name: &str, granularity: Granularity, value: f64) -> Arc<dyn Metric> {
		FnMetric::new(
			MetricDescriptor::new(name, granularity, OutputShape::scalar(0.0, 10.0)),
			move |_| Ok(Judgement::new(ScoreValue::Scalar(value))),
		)
	}
}

/// Scalar metric that asks the judge `"<metric> <case> <target>"` and parses
/// the reply as a number.
pub struct JudgedScalar {
	descriptor: MetricDescriptor,
}

impl JudgedScalar {
	pub fn new(name: &str, granularity: Granularity) -> Arc<dyn Metric> {
		Arc::new(Self {
			descriptor: MetricDescriptor::new(name, granularity, OutputShape::scalar(0.0, 10.0)),
		})
	}
}

#[async_trait]
impl Metric for JudgedScalar {
	fn descriptor(&self) -> &MetricDescriptor {
		&self.descriptor
	}

	async fn evaluate(
		&self,
		target: EvalTarget<'_>,
		judge: &JudgeClient,
	) -> Result<Judgement, MetricError> {
		let prompt = format!("{} {} {}", self.descriptor.name, target.case().id, target.target());
		let reply = judge.complete(&prompt).await?;
		let value: f64 = reply
			.trim()
			.parse()
			.map_err(|_| MetricError::Unparsable(format!("not a number: {reply:?}")))?;
		Ok(Judgement::new(ScoreValue::Scalar(value)))
	}
}

/// Fails when overall corpus coverage is below `min`.
pub fn assert_min_coverage(run: &EvalRun, min: f64) -> Result<()> {
	if run.corpus.coverage < min {
		anyhow::bail!(
			"Evaluation failed: coverage {:.1}% is below threshold {:.1}%\n{}",
			run.corpus.coverage * 100.0,
			min * 100.0,
			run.summary_table()
		);
	}
	Ok(())
}

/// Fails when any unit or case input failed.
pub fn assert_no_failures(run: &EvalRun) -> Result<()> {
	let unit_failures: usize = run.cases.iter().map(|c| c.failures.len()).sum();
	let failures = unit_failures + run.corpus.rejected.len();
	if failures > 0 {
		anyhow::bail!("Evaluation failed: {} failure record(s)\n{}", failures, run.summary_table());
	}
	Ok(())
}

/// Fails when any case report is incomplete.
pub fn assert_complete(run: &EvalRun) -> Result<()> {
	let incomplete: Vec<&str> = run
		.cases
		.iter()
		.filter(|c| !c.complete)
		.map(|c| c.case_id.as_str())
		.collect();
	if !incomplete.is_empty() {
		anyhow::bail!("Evaluation incomplete for cases {:?}\n{}", incomplete, run.summary_table());
	}
	Ok(())
}
