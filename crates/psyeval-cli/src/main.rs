use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use psyeval_core::config::JudgeConfig;
use psyeval_core::metrics::CATALOGUE;
use psyeval_core::{
	open_source, Engine, EvalConfig, JudgeClient, JudgeSettings, MetricRegistry,
	OpenAiCompatService, PromptLibrary,
};
use psyeval_store::Store;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "psyeval", about = "Score multi-session counseling dialogues with an LLM judge")]
struct Cli {
	/// Emit logs as JSON lines
	#[arg(long, global = true, action = ArgAction::SetTrue)]
	log_json: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Evaluate a corpus
	Run(RunArgs),
	/// List the metrics that can be named in a config
	Metrics,
	/// List runs saved in a store
	Runs {
		#[arg(long, default_value = "psyeval.db")]
		db: PathBuf,
	},
}

#[derive(Debug, Clone, Parser)]
struct RunArgs {
	/// YAML evaluation config
	#[arg(long)]
	config: PathBuf,

	/// Corpus path; overrides data.path from the config
	#[arg(long)]
	data: Option<PathBuf>,

	/// Cases in flight; overrides engine.case_concurrency
	#[arg(long)]
	concurrency: Option<usize>,

	/// Output JSON result to a file
	#[arg(long)]
	json_out: Option<PathBuf>,

	/// Save the run into this SQLite store
	#[arg(long)]
	db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.log_json);
	match cli.command {
		Commands::Run(args) => run(args).await?,
		Commands::Metrics => print_metrics(),
		Commands::Runs { db } => list_runs(db)?,
	}
	Ok(())
}

fn init_tracing(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
	if json {
		builder.json().init();
	} else {
		builder.init();
	}
}

async fn run(args: RunArgs) -> Result<()> {
	let mut config = EvalConfig::from_path(&args.config).await?;
	apply_overrides(&mut config, &args);
	config.validate()?;

	let settings = effective_settings(JudgeSettings::from_env()?, &config.judge);
	info!(model = %settings.model, base_url = %settings.base_url, "judge configured");
	let judge = JudgeClient::new(
		Arc::new(OpenAiCompatService::from_settings(&settings)),
		settings.model.clone(),
		settings.temperature,
		config.judge.retry.policy(),
		config.judge.retry.max_in_flight,
	);

	let library = PromptLibrary::from_dir(&config.prompts_dir);
	let registry = MetricRegistry::from_config(&config.metrics, &library)
		.with_context(|| format!("Failed to build metrics from {:?}", args.config))?;

	let engine = Engine::builder()
		.registry(registry)
		.judge(judge)
		.config(&config.engine)
		.build()?;

	let source = open_source(&config.data.path).await?;
	let result = engine.run(source.as_ref()).await?;
	println!("{}", result.summary_table());

	if let Some(path) = args.json_out {
		let json = serde_json::to_string_pretty(&result)?;
		tokio::fs::write(&path, json)
			.await
			.with_context(|| format!("Failed to write {:?}", path))?;
	}

	if let Some(db) = args.db {
		let store = Store::open(&db)?;
		let run_id = store.create_run(Some(json!({
			"config": args.config.display().to_string(),
			"data": config.data.path.display().to_string(),
			"model": settings.model,
		})))?;
		store.save_run(run_id, &result)?;
		info!(run_id, db = %db.display(), "run saved");
	}

	Ok(())
}

fn apply_overrides(config: &mut EvalConfig, args: &RunArgs) {
	if let Some(data) = &args.data {
		config.data.path = data.clone();
	}
	if let Some(n) = args.concurrency {
		config.engine.case_concurrency = n;
	}
}

/// The config's model and temperature win over the environment.
fn effective_settings(mut settings: JudgeSettings, judge: &JudgeConfig) -> JudgeSettings {
	if let Some(model) = judge.model.as_ref().filter(|m| !m.trim().is_empty()) {
		settings.model = model.clone();
	}
	settings.temperature = judge.temperature;
	settings
}

fn print_metrics() {
	for entry in CATALOGUE {
		println!(
			"{:<18} {:<10} {:<12} {}",
			entry.name,
			entry.perspective.to_string(),
			format!("{:?}", entry.granularity),
			entry.summary
		);
	}
}

fn list_runs(db: PathBuf) -> Result<()> {
	let store = Store::open(&db)?;
	for run in store.list_runs()? {
		let coverage = run
			.coverage
			.map(|c| format!("{:.1}%", c * 100.0))
			.unwrap_or_else(|| "-".into());
		println!(
			"{:>4}  {}  cases={}  coverage={}",
			run.id,
			run.created_at.to_rfc3339(),
			run.cases,
			coverage
		);
	}
	Ok(())
}
