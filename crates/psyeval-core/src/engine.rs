use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, FuturesUnordered, StreamExt};
use futures::FutureExt;
use psyeval_types::{
	Case, CaseReport, EvalRun, FailureKind, FailureRecord, Granularity, ScoreRecord, Session,
	UnitOutcome,
};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, aggregate_corpus};
use crate::config::EngineConfig;
use crate::datasource::CaseSource;
use crate::judge::JudgeClient;
use crate::metric::EvalTarget;
use crate::registry::{MetricRegistry, MetricSpec, RegisteredMetric};
use crate::walker::{CaseWalker, IntegrityError, SessionContext};

/// Requests cancellation of the case holding the paired [`CancelSignal`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
	tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
	pub fn cancel(&self) {
		self.tx.send_replace(true);
	}
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
	rx: watch::Receiver<bool>,
}

impl CancelSignal {
	pub fn is_cancelled(&self) -> bool {
		*self.rx.borrow()
	}

	/// Resolves once cancellation is requested; never if the handle is dropped first.
	pub async fn cancelled(&mut self) {
		loop {
			if *self.rx.borrow_and_update() {
				return;
			}
			if self.rx.changed().await.is_err() {
				std::future::pending::<()>().await;
			}
		}
	}
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
	let (tx, rx) = watch::channel(false);
	(CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// One case to evaluate, optionally cancellable.
pub struct CaseJob {
	pub case: Case,
	pub cancel: Option<CancelSignal>,
}

impl From<Case> for CaseJob {
	fn from(case: Case) -> Self {
		Self { case, cancel: None }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
	Pending,
	Dispatched,
	Succeeded,
	Failed,
}

impl UnitState {
	fn is_terminal(self) -> bool {
		matches!(self, UnitState::Succeeded | UnitState::Failed)
	}
}

/// Why a case stopped before all its units finished.
#[derive(Debug, Clone, Copy)]
enum Abandon {
	Timeout(Duration),
	Cancelled,
}

pub struct EngineBuilder {
	registry: Option<MetricRegistry>,
	judge: Option<JudgeClient>,
	walker: CaseWalker,
	case_concurrency: usize,
	unit_concurrency: usize,
	case_timeout: Option<Duration>,
}

impl Default for EngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl EngineBuilder {
	pub fn new() -> Self {
		Self {
			registry: None,
			judge: None,
			walker: CaseWalker::default(),
			case_concurrency: 4,
			unit_concurrency: 32,
			case_timeout: None,
		}
	}

	pub fn registry(mut self, registry: MetricRegistry) -> Self {
		self.registry = Some(registry);
		self
	}

	pub fn judge(mut self, judge: JudgeClient) -> Self {
		self.judge = Some(judge);
		self
	}

	pub fn walker(mut self, walker: CaseWalker) -> Self {
		self.walker = walker;
		self
	}

	pub fn case_concurrency(mut self, n: usize) -> Self {
		self.case_concurrency = n.max(1);
		self
	}

	pub fn unit_concurrency(mut self, n: usize) -> Self {
		self.unit_concurrency = n.max(1);
		self
	}

	pub fn case_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.case_timeout = timeout;
		self
	}

	/// Concurrency limits, case budget and context window from configuration.
	pub fn config(self, config: &EngineConfig) -> Self {
		self.case_concurrency(config.case_concurrency)
			.unit_concurrency(config.unit_concurrency)
			.case_timeout(config.case_timeout())
			.walker(CaseWalker::new(config.context_window))
	}

	pub fn build(self) -> Result<Engine> {
		let registry = self.registry.ok_or_else(|| anyhow::anyhow!("registry must be set"))?;
		let judge = self.judge.ok_or_else(|| anyhow::anyhow!("judge must be set"))?;
		if registry.is_empty() {
			warn!("no metrics registered; every case will report zero units");
		}
		Ok(Engine {
			specs: registry.specs(),
			registry: Arc::new(registry),
			judge,
			walker: self.walker,
			case_concurrency: self.case_concurrency,
			unit_permits: Arc::new(Semaphore::new(self.unit_concurrency)),
			case_timeout: self.case_timeout,
		})
	}
}

/// Fans cases out into (case, metric, target) units and collects reports.
pub struct Engine {
	registry: Arc<MetricRegistry>,
	specs: Vec<MetricSpec>,
	judge: JudgeClient,
	walker: CaseWalker,
	case_concurrency: usize,
	unit_permits: Arc<Semaphore>,
	case_timeout: Option<Duration>,
}

impl Engine {
	pub fn builder() -> EngineBuilder {
		EngineBuilder::new()
	}

	pub fn specs(&self) -> &[MetricSpec] {
		&self.specs
	}

	pub fn judge(&self) -> &JudgeClient {
		&self.judge
	}

	/// Loads the corpus and evaluates every case in it.
	///
	/// Only a corpus that cannot be opened is an error.
	pub async fn run(&self, source: &dyn CaseSource) -> Result<EvalRun> {
		let inputs = source.load().await?;
		let mut cases = Vec::new();
		let mut rejected = Vec::new();
		for input in inputs {
			match input {
				Ok(case) => cases.push(CaseJob::from(case)),
				Err(r) => rejected.push(r.into_failure()),
			}
		}
		Ok(self.run_jobs(cases, rejected).await)
	}

	pub async fn run_cases(&self, cases: Vec<Case>) -> EvalRun {
		self.run_jobs(cases.into_iter().map(CaseJob::from).collect(), Vec::new()).await
	}

	/// Evaluates jobs up to `case_concurrency` at a time; reports keep job order.
	pub async fn run_jobs(&self, jobs: Vec<CaseJob>, rejected: Vec<FailureRecord>) -> EvalRun {
		info!(
			cases = jobs.len(),
			rejected = rejected.len(),
			metrics = self.registry.len(),
			"starting evaluation run"
		);
		let stream = stream::iter(jobs.into_iter().enumerate()).map(|(pos, job)| async move {
			(pos, self.evaluate_case(Arc::new(job.case), job.cancel).await)
		});
		let mut reports: Vec<(usize, CaseReport)> =
			stream.buffer_unordered(self.case_concurrency).collect().await;
		reports.sort_by_key(|(pos, _)| *pos);
		let cases: Vec<CaseReport> = reports.into_iter().map(|(_, r)| r).collect();

		let corpus = aggregate_corpus(&cases, rejected, &self.specs);
		info!(
			cases = corpus.stats.cases,
			incomplete = corpus.stats.incomplete,
			units_succeeded = corpus.stats.units_succeeded,
			units_failed = corpus.stats.units_failed,
			"evaluation run finished"
		);
		EvalRun { cases, corpus }
	}

	/// Evaluates one case. Never fails: every problem becomes a failure record.
	pub async fn evaluate_case(
		&self,
		case: Arc<Case>,
		mut cancel: Option<CancelSignal>,
	) -> CaseReport {
		let walked: Vec<(&Session, SessionContext)> = match self.plan_walk(&case) {
			Ok(walked) => walked,
			Err(e) => {
				warn!(case_id = %case.id, error = %e, "case failed integrity checks");
				let failure = FailureRecord::integrity(case.id.clone(), e.to_string());
				return aggregate(&case, &self.specs, vec![UnitOutcome::Failed(failure)], false);
			}
		};

		let case_ref: &Case = &case;
		let mut units: Vec<(&RegisteredMetric, EvalTarget<'_>)> = Vec::new();
		for entry in self.registry.list() {
			match entry.metric.granularity() {
				Granularity::PerCase => units.push((entry, EvalTarget::Case(case_ref))),
				Granularity::PerSession => {
					for (session, context) in &walked {
						let target =
							EvalTarget::Session { case: case_ref, session: *session, context };
						units.push((entry, target));
					}
				}
			}
		}

		let mut states = vec![UnitState::Pending; units.len()];
		let mut outcomes = Vec::with_capacity(units.len());
		let mut pending = FuturesUnordered::new();
		for (id, (entry, target)) in units.iter().enumerate() {
			pending.push(self.run_unit(id, entry, *target));
			states[id] = UnitState::Dispatched;
		}
		debug!(case_id = %case.id, units = units.len(), "dispatched units");

		let deadline = self.case_timeout.map(|t| Instant::now() + t);
		let mut abandoned = None;
		loop {
			tokio::select! {
				biased;
				_ = wait_cancelled(&mut cancel) => {
					abandoned = Some(Abandon::Cancelled);
					break;
				}
				_ = wait_deadline(deadline) => {
					abandoned = self.case_timeout.map(Abandon::Timeout);
					break;
				}
				next = pending.next() => match next {
					Some((id, outcome)) => {
						states[id] = if outcome.is_success() {
							UnitState::Succeeded
						} else {
							UnitState::Failed
						};
						outcomes.push(outcome);
					}
					None => break,
				},
			}
		}
		drop(pending);

		if let Some(reason) = abandoned {
			for (id, (entry, target)) in units.iter().enumerate() {
				if states[id].is_terminal() {
					continue;
				}
				let (kind, message) = match reason {
					Abandon::Timeout(t) => {
						(FailureKind::Timeout, format!("case budget of {t:?} expired"))
					}
					Abandon::Cancelled => {
						(FailureKind::Cancelled, "case was cancelled".to_string())
					}
				};
				outcomes.push(UnitOutcome::Failed(FailureRecord::for_metric(
					entry.metric.name(),
					case.id.clone(),
					target.target(),
					kind,
					message,
				)));
				states[id] = UnitState::Failed;
			}
			warn!(case_id = %case.id, reason = ?reason, "case abandoned before all units finished");
		}
		debug_assert!(states.iter().all(|s| s.is_terminal()));

		let report = aggregate(&case, &self.specs, outcomes, abandoned.is_none());
		info!(
			case_id = %case.id,
			succeeded = report.scores.len(),
			failed = report.failures.len(),
			complete = report.complete,
			"case evaluated"
		);
		report
	}

	fn plan_walk<'a>(
		&self,
		case: &'a Case,
	) -> Result<Vec<(&'a Session, SessionContext)>, IntegrityError> {
		let walk = self.walker.walk(case)?;
		let needs_sessions = self
			.registry
			.list()
			.any(|e| e.metric.granularity() == Granularity::PerSession);
		if needs_sessions && case.sessions.is_empty() {
			return Err(IntegrityError::NoSessions);
		}
		Ok(walk.collect())
	}

	async fn run_unit(
		&self,
		id: usize,
		entry: &RegisteredMetric,
		target: EvalTarget<'_>,
	) -> (usize, UnitOutcome) {
		let metric = entry.metric.name();
		let case_id = target.case().id.as_str();
		let unit_target = target.target();
		let failed = |kind: FailureKind, message: String| {
			let record = FailureRecord::for_metric(metric, case_id, unit_target, kind, message);
			UnitOutcome::Failed(record)
		};

		let _permit = match self.unit_permits.acquire().await {
			Ok(permit) => permit,
			Err(_) => return (id, failed(FailureKind::Cancelled, "unit pool closed".to_string())),
		};

		let result = AssertUnwindSafe(entry.metric.evaluate(target, &self.judge))
			.catch_unwind()
			.await;
		let outcome = match result {
			Ok(Ok(judgement)) => match entry.metric.descriptor().shape.check(&judgement.value) {
				Ok(()) => {
					debug!(metric, case_id, target = %unit_target, "unit succeeded");
					UnitOutcome::Succeeded(ScoreRecord {
						metric: metric.to_string(),
						case_id: case_id.to_string(),
						target: unit_target,
						value: judgement.value,
						rationale: judgement.rationale,
					})
				}
				Err(reason) => {
					warn!(
						metric,
						case_id,
						target = %unit_target,
						%reason,
						"judgement does not fit declared shape"
					);
					let message = format!("judgement does not fit declared shape: {reason}");
					failed(FailureKind::UnparsableResult, message)
				}
			},
			Ok(Err(e)) => {
				warn!(
					metric,
					case_id,
					target = %unit_target,
					kind = %e.kind(),
					error = %e,
					"unit failed"
				);
				failed(e.kind(), e.to_string())
			}
			Err(panic) => {
				let message = panic_message(panic.as_ref());
				warn!(metric, case_id, target = %unit_target, %message, "metric panicked");
				failed(FailureKind::Panicked, message)
			}
		};
		(id, outcome)
	}
}

async fn wait_cancelled(signal: &mut Option<CancelSignal>) {
	match signal {
		Some(signal) => signal.cancelled().await,
		None => std::future::pending().await,
	}
}

async fn wait_deadline(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		format!("metric panicked: {s}")
	} else if let Some(s) = panic.downcast_ref::<String>() {
		format!("metric panicked: {s}")
	} else {
		"metric panicked".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::judge::JudgeError;
	use crate::metric::{Judgement, MetricError};
	use crate::registry::MetricOptions;
	use crate::testing::{
		assert_complete, assert_min_coverage, assert_no_failures, fast_retry_policy, judge_client,
		sample_case, ConstMetric, FnMetric, JudgedScalar, ScriptedJudge,
	};
	use psyeval_types::{MetricDescriptor, OutputShape, ScoreValue, Stage::*, Target};

	fn registry(metrics: Vec<Arc<dyn crate::metric::Metric>>) -> MetricRegistry {
		let mut registry = MetricRegistry::new();
		for metric in metrics {
			registry.register(metric, MetricOptions::default()).unwrap();
		}
		registry
	}

	fn engine(metrics: Vec<Arc<dyn crate::metric::Metric>>, judge: JudgeClient) -> Engine {
		Engine::builder().registry(registry(metrics)).judge(judge).build().unwrap()
	}

	fn idle_judge() -> JudgeClient {
		judge_client(Arc::new(ScriptedJudge::always("5")), 1)
	}

	fn failing(name: &str) -> Arc<dyn crate::metric::Metric> {
		FnMetric::new(
			MetricDescriptor::new(name, Granularity::PerSession, OutputShape::scalar(0.0, 10.0)),
			|_| Err(MetricError::Unparsable("judge replied with prose".into())),
		)
	}

	#[tokio::test]
	async fn every_unit_terminates_exactly_once() {
		let engine = engine(
			vec![
				ConstMetric::scalar("s1", Granularity::PerSession, 1.0),
				ConstMetric::scalar("s2", Granularity::PerSession, 2.0),
				ConstMetric::scalar("c1", Granularity::PerCase, 3.0),
			],
			idle_judge(),
		);
		let case = sample_case("c", &[CaseConceptualization, CoreIntervention, Consolidation]);
		let run = engine.run_cases(vec![case]).await;

		let report = &run.cases[0];
		// N×M + K = 3×2 + 1
		assert_eq!(report.scores.len() + report.failures.len(), 7);
		assert_eq!(report.scores.len(), 7);
		assert_no_failures(&run).unwrap();
		assert_complete(&run).unwrap();
		assert_min_coverage(&run, 1.0).unwrap();
		let mut targets: Vec<Target> = report.scores_for("s1").map(|s| s.target).collect();
		targets.dedup();
		assert_eq!(targets, vec![Target::Session(1), Target::Session(2), Target::Session(3)]);
	}

	#[tokio::test]
	async fn failing_metric_does_not_change_sibling_scores() {
		let case = sample_case("c", &[CaseConceptualization, CoreIntervention]);
		let ok = ConstMetric::scalar("ok", Granularity::PerSession, 4.0);
		let alone = engine(vec![ok], idle_judge()).run_cases(vec![case.clone()]).await;
		let with_failure = engine(
			vec![ConstMetric::scalar("ok", Granularity::PerSession, 4.0), failing("broken")],
			idle_judge(),
		)
		.run_cases(vec![case])
		.await;

		let a: Vec<_> = alone.cases[0].scores_for("ok").cloned().collect();
		let b: Vec<_> = with_failure.cases[0].scores_for("ok").cloned().collect();
		assert_eq!(a, b);
		let failures = &with_failure.cases[0].failures;
		assert_eq!(failures.len(), 2);
		assert!(failures.iter().all(|f| f.kind == FailureKind::UnparsableResult));
		assert!(with_failure.cases[0].complete);
	}

	#[tokio::test]
	async fn out_of_order_stages_yield_one_integrity_failure() {
		let engine = engine(
			vec![
				ConstMetric::scalar("s", Granularity::PerSession, 1.0),
				ConstMetric::scalar("c", Granularity::PerCase, 1.0),
			],
			idle_judge(),
		);
		let case = sample_case("bad", &[Consolidation, CaseConceptualization]);
		let run = engine.run_cases(vec![case]).await;
		let report = &run.cases[0];
		assert!(report.scores.is_empty());
		assert_eq!(report.failures.len(), 1);
		assert_eq!(report.failures[0].kind, FailureKind::DataIntegrity);
		assert!(report.failures[0].metric.is_none());
		assert!(!report.complete);
	}

	#[tokio::test]
	async fn rejected_case_lowers_metric_coverage() {
		let engine =
			engine(vec![ConstMetric::scalar("s", Granularity::PerSession, 1.0)], idle_judge());
		let run = engine
			.run_cases(vec![
				sample_case("good", &[CaseConceptualization, CoreIntervention]),
				sample_case("bad", &[Consolidation, CaseConceptualization]),
			])
			.await;

		let bad = run.case("bad").unwrap().metric("s").unwrap();
		assert_eq!((bad.succeeded, bad.failed), (0, 2));

		let corpus = run.corpus.metric("s").unwrap();
		assert_eq!((corpus.succeeded, corpus.failed), (2, 2));
		assert!(corpus.coverage < 1.0);
		assert!(assert_min_coverage(&run, 1.0).is_err());
	}

	#[tokio::test]
	async fn zero_sessions_with_per_session_metric_is_an_integrity_failure() {
		let engine =
			engine(vec![ConstMetric::scalar("s", Granularity::PerSession, 1.0)], idle_judge());
		let run = engine.run_cases(vec![sample_case("empty", &[])]).await;
		assert_eq!(run.cases[0].failures[0].kind, FailureKind::DataIntegrity);
		assert!(run.cases[0].failures[0].message.contains("no sessions"));

		let engine = engine_with_case_metric_only();
		let run = engine.run_cases(vec![sample_case("empty", &[])]).await;
		assert_eq!(run.cases[0].scores.len(), 1);
	}

	fn engine_with_case_metric_only() -> Engine {
		engine(vec![ConstMetric::scalar("c", Granularity::PerCase, 1.0)], idle_judge())
	}

	#[tokio::test]
	async fn exhausted_retries_become_one_unavailable_failure() {
		let service = Arc::new(ScriptedJudge::from_fn(|_| {
			Err(JudgeError::Timeout(Duration::from_secs(1)))
		}));
		let engine = engine(
			vec![JudgedScalar::new("judged", Granularity::PerCase)],
			judge_client(service.clone(), 3),
		);
		let run = engine.run_cases(vec![sample_case("c", &[CaseConceptualization])]).await;

		assert_eq!(service.calls(), 3);
		let failures = &run.cases[0].failures;
		assert_eq!(failures.len(), 1);
		assert_eq!(failures[0].kind, FailureKind::JudgeUnavailable);
		assert!(run.cases[0].complete);
	}

	#[tokio::test]
	async fn empty_judge_reply_is_unparsable_not_rejected() {
		let service = Arc::new(ScriptedJudge::from_fn(|_| {
			Err(JudgeError::MalformedResponse("missing choices[0].message.content".into()))
		}));
		let engine = engine(
			vec![JudgedScalar::new("judged", Granularity::PerCase)],
			judge_client(service.clone(), 3),
		);
		let run = engine.run_cases(vec![sample_case("c", &[CaseConceptualization])]).await;

		assert_eq!(service.calls(), 1);
		assert_eq!(run.cases[0].failures[0].kind, FailureKind::UnparsableResult);
	}

	#[tokio::test]
	async fn judged_metric_scores_each_session() {
		let service = Arc::new(ScriptedJudge::from_fn(|req| {
			Ok(if req.prompt.ends_with("session 2") { "8".to_string() } else { "6".to_string() })
		}));
		let engine = engine(
			vec![JudgedScalar::new("judged", Granularity::PerSession)],
			judge_client(service, 1),
		);
		let case = sample_case("c", &[CaseConceptualization, CoreIntervention]);
		let run = engine.run_cases(vec![case]).await;
		let values: Vec<f64> =
			run.cases[0].scores.iter().filter_map(|s| s.value.as_scalar()).collect();
		assert_eq!(values, vec![6.0, 8.0]);
		let corpus = run.corpus.metric("judged").unwrap();
		assert_eq!(corpus.aggregate.as_ref().unwrap().mean(), Some(7.0));
	}

	#[tokio::test]
	async fn case_budget_turns_unfinished_units_into_timeouts() {
		let service = Arc::new(ScriptedJudge::always("5").with_delay(Duration::from_secs(5)));
		let engine = Engine::builder()
			.registry(registry(vec![
				JudgedScalar::new("slow", Granularity::PerSession),
				ConstMetric::scalar("fast", Granularity::PerCase, 1.0),
			]))
			.judge(judge_client(service, 1))
			.case_timeout(Some(Duration::from_millis(50)))
			.build()
			.unwrap();
		let report = engine
			.evaluate_case(
				Arc::new(sample_case("c", &[CaseConceptualization, CoreIntervention])),
				None,
			)
			.await;

		assert!(!report.complete);
		assert_eq!(report.scores.len(), 1);
		assert_eq!(report.failures.len(), 2);
		assert!(report.failures.iter().all(|f| f.kind == FailureKind::Timeout));
	}

	#[tokio::test]
	async fn cancelling_one_case_leaves_others_untouched() {
		let engine =
			engine(vec![ConstMetric::scalar("s", Granularity::PerSession, 1.0)], idle_judge());
		let (handle, signal) = cancel_pair();
		handle.cancel();
		let jobs = vec![
			CaseJob {
				case: sample_case("cancelled", &[CaseConceptualization, CoreIntervention]),
				cancel: Some(signal),
			},
			CaseJob::from(sample_case("kept", &[CaseConceptualization])),
		];
		let run = engine.run_jobs(jobs, Vec::new()).await;

		let cancelled = run.case("cancelled").unwrap();
		assert!(!cancelled.complete);
		assert_eq!(cancelled.failures.len(), 2);
		assert!(cancelled.failures.iter().all(|f| f.kind == FailureKind::Cancelled));
		let kept = run.case("kept").unwrap();
		assert!(kept.complete);
		assert_eq!(kept.scores.len(), 1);
		assert_eq!(run.corpus.stats.incomplete, 1);
	}

	#[tokio::test]
	async fn cancel_during_slow_judge_calls() {
		let service = Arc::new(ScriptedJudge::always("5").with_delay(Duration::from_secs(5)));
		let engine = engine(
			vec![JudgedScalar::new("slow", Granularity::PerSession)],
			judge_client(service, 1),
		);
		let (handle, signal) = cancel_pair();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			handle.cancel();
		});
		let report = engine
			.evaluate_case(Arc::new(sample_case("c", &[CaseConceptualization])), Some(signal))
			.await;
		assert_eq!(report.failures[0].kind, FailureKind::Cancelled);
		assert!(engine.judge().in_flight() == 0);
	}

	#[tokio::test]
	async fn panicking_metric_is_recorded() {
		let panicky = FnMetric::new(
			MetricDescriptor::new("panicky", Granularity::PerCase, OutputShape::scalar(0.0, 10.0)),
			|_| panic!("index out of bounds"),
		);
		let engine = engine(
			vec![panicky, ConstMetric::scalar("ok", Granularity::PerCase, 2.0)],
			idle_judge(),
		);
		let run = engine.run_cases(vec![sample_case("c", &[CaseConceptualization])]).await;
		let report = &run.cases[0];
		assert_eq!(report.scores.len(), 1);
		assert_eq!(report.failures[0].kind, FailureKind::Panicked);
		assert!(report.failures[0].message.contains("index out of bounds"));
	}

	#[tokio::test]
	async fn judgement_outside_declared_shape_is_unparsable() {
		let wild = FnMetric::new(
			MetricDescriptor::new("wild", Granularity::PerCase, OutputShape::scalar(0.0, 10.0)),
			|_| Ok(Judgement::new(ScoreValue::Scalar(42.0))),
		);
		let run = engine(vec![wild], idle_judge())
			.run_cases(vec![sample_case("c", &[Consolidation])])
			.await;
		assert_eq!(run.cases[0].failures[0].kind, FailureKind::UnparsableResult);
	}

	#[tokio::test]
	async fn judge_permits_bound_concurrency_across_cases() {
		let service = Arc::new(ScriptedJudge::always("5").with_delay(Duration::from_millis(10)));
		let judge = JudgeClient::new(service.clone(), "m", 0.0, fast_retry_policy(1), 2);
		let engine = Engine::builder()
			.registry(registry(vec![JudgedScalar::new("j", Granularity::PerSession)]))
			.judge(judge)
			.case_concurrency(4)
			.build()
			.unwrap();
		let cases = (0..4)
			.map(|i| {
				let stages = [CaseConceptualization, CoreIntervention, Consolidation];
				sample_case(&format!("c{i}"), &stages)
			})
			.collect();
		let run = engine.run_cases(cases).await;

		assert_eq!(run.corpus.stats.units_succeeded, 12);
		assert!(service.max_concurrent() <= 2);
		let ids: Vec<&str> = run.cases.iter().map(|c| c.case_id.as_str()).collect();
		assert_eq!(ids, vec!["c0", "c1", "c2", "c3"]);
	}

	#[test]
	fn builder_requires_registry_and_judge() {
		assert!(Engine::builder().judge(idle_judge()).build().is_err());
		assert!(Engine::builder().registry(MetricRegistry::new()).build().is_err());
	}
}
