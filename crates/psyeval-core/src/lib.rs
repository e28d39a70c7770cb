//! psyeval-core: evaluation orchestration for multi-session counseling
//! dialogues. Register metrics, point the engine at a judge and a case
//! source, and collect per-case and corpus reports.
//! See `examples/simple.rs` for a quickstart.

pub mod aggregate;
pub mod config;
pub mod datasource;
pub mod engine;
pub mod judge;
pub mod metric;
pub mod metrics;
pub mod prompt;
pub mod registry;
pub mod testing;
pub mod walker;

pub use aggregate::{aggregate, aggregate_corpus};
pub use config::{ConfigError, EvalConfig, JudgeSettings, MetricConfig};
pub use datasource::{
	open_source, CaseInput, CaseSource, JsonDirCaseSource, JsonlCaseSource, RejectedCase,
	VecCaseSource,
};
pub use engine::{cancel_pair, CancelHandle, CancelSignal, CaseJob, Engine, EngineBuilder};
pub use judge::openai::OpenAiCompatService;
pub use judge::{JudgeClient, JudgeError, JudgeRequest, JudgeService, RetryPolicy};
pub use metric::{EvalTarget, Judgement, Metric, MetricError};
pub use prompt::{PromptError, PromptLibrary, PromptTemplate};
pub use registry::{MetricOptions, MetricRegistry, MetricSpec, RegisteredMetric, RegistryError};
pub use walker::{CaseWalker, IntegrityError, SessionContext, SessionDigest};

pub use psyeval_types as types;
