use std::sync::Arc;

use psyeval_core::metrics::lookup;
use psyeval_core::testing::{fast_retry_policy, ScriptedJudge};
use psyeval_core::types::{Case, Session, Stage, TherapySchool, Turn};
use psyeval_core::{
	Engine, JsonlCaseSource, JudgeClient, MetricOptions, MetricRegistry, PromptLibrary,
	VecCaseSource,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	// Example 1: inline cases scored by a scripted judge
	let case = Case::new(
		"demo-1",
		TherapySchool::Cbt,
		vec![
			Session::new(
				1,
				Stage::CaseConceptualization,
				vec![
					Turn::counselor("What brings you in today?"),
					Turn::client("I can't stop worrying about my exams."),
				],
			),
			Session::new(
				2,
				Stage::CoreIntervention,
				vec![
					Turn::counselor("Last time you mentioned the exams. What thought comes first?"),
					Turn::client("That I'll fail and disappoint everyone."),
				],
			),
		],
	);

	let prompts = PromptLibrary::in_memory([
		("HTAIS", "HTAIS", "Rate the alliance.\n{{ intake_form }}\n{{ diag }}"),
		(
			"stage_alignment",
			"stage_alignment",
			"Stage: {{ stage }}\nEarlier: {{ history }}\n{{ diag }}",
		),
	]);
	let mut registry = MetricRegistry::new();
	for name in ["HTAIS", "stage_alignment"] {
		let entry = lookup(name).ok_or_else(|| anyhow::anyhow!("unknown metric {name}"))?;
		registry.register(entry.build(None, &prompts)?, MetricOptions::default())?;
	}

	// Replies depend on which rubric is asking
	let judge = ScriptedJudge::from_fn(|req| {
		Ok(if req.prompt.starts_with("Rate the alliance") {
			r#"{"items": [{"item": "bond", "score": 4}, {"item": "task", "score": 5}]}"#.to_string()
		} else {
			r#"{"label": "aligned", "rationale": "work matches the stage"}"#.to_string()
		})
	});
	let judge = JudgeClient::new(Arc::new(judge), "scripted", 0.0, fast_retry_policy(3), 4);

	let engine = Engine::builder()
		.registry(registry)
		.judge(judge)
		.case_concurrency(2)
		.build()?;

	let run = engine.run(&VecCaseSource::new(vec![case])).await?;
	println!("{}", run.summary_table());

	// Example 2: load cases from a JSONL file if provided
	if let Some(path) = std::env::args().nth(1) {
		let run = engine.run(&JsonlCaseSource::new(path)).await?;
		println!("{}", serde_json::to_string_pretty(&run.corpus)?);
	}

	Ok(())
}
