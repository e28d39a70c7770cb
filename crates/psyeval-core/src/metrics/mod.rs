//! Built-in counseling rubrics and the catalogue that names them.

pub mod catalogue;
pub mod label;
pub mod panas;
pub mod parse;
pub mod rro;
pub mod rubric;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::judge::JudgeClient;
use crate::metric::{EvalTarget, MetricError};
use crate::prompt::{render_case, render_session, PromptVars};

pub use catalogue::{lookup, CatalogueEntry, CATALOGUE};
pub use label::LabelRubric;
pub use panas::Panas;
pub use parse::ReplyValidator;
pub use rro::Rro;
pub use rubric::{ItemRubric, RawScale};

/// Whose behaviour a rubric rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Perspective {
	Counselor,
	Client,
	Dyad,
}

impl fmt::Display for Perspective {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Perspective::Counselor => "counselor",
			Perspective::Client => "client",
			Perspective::Dyad => "dyad",
		})
	}
}

/// Template variables for a target.
///
/// `diag` is the whole case for per-case targets and the current session
/// otherwise; `history` and `stage` are only meaningful per session.
pub fn prompt_vars(target: &EvalTarget<'_>) -> PromptVars {
	let case = target.case();
	let mut vars = PromptVars::new();
	let intake = if case.profile.is_null() {
		"{}".to_string()
	} else {
		serde_json::to_string_pretty(&case.profile).unwrap_or_else(|_| case.profile.to_string())
	};
	vars.insert("intake_form", intake);
	vars.insert("goals", case.goals.join("\n"));
	vars.insert("school", case.school.to_string());
	vars.insert("case_id", case.id.clone());
	vars.insert("total_sessions", case.sessions.len().to_string());

	match target {
		EvalTarget::Case(case) => {
			vars.insert("diag", render_case(case));
			let stages: Vec<&str> = case.sessions.iter().map(|s| s.stage.as_str()).collect();
			vars.insert("stage", stages.join(", "));
			vars.insert("history", String::new());
		}
		EvalTarget::Session { session, context, .. } => {
			vars.insert("diag", render_session(session));
			vars.insert("stage", session.stage.to_string());
			vars.insert("history", context.history_text());
			vars.insert("session_index", session.index.to_string());
		}
	}
	vars
}

/// One structured judge call, parsed and validated against `validator`.
pub(crate) async fn ask<T: DeserializeOwned>(
	judge: &JudgeClient,
	validator: &ReplyValidator,
	prompt: &str,
) -> Result<T, MetricError> {
	let raw = judge.complete_structured(prompt, Some(validator.schema())).await?;
	validator.parse(&raw)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::sample_case;
	use crate::walker::CaseWalker;
	use psyeval_types::Stage;
	use serde_json::json;

	#[test]
	fn session_vars_include_stage_history_and_intake() {
		let case = sample_case("c9", &[Stage::CaseConceptualization, Stage::CoreIntervention])
			.with_profile(json!({"age": 29}))
			.with_goals(["sleep better"]);
		let (session, context) = CaseWalker::default().walk(&case).unwrap().nth(1).unwrap();
		let vars = prompt_vars(&EvalTarget::Session { case: &case, session, context: &context });

		assert_eq!(vars["stage"], "core_intervention");
		assert_eq!(vars["session_index"], "2");
		assert!(vars["history"].starts_with("[session 1"));
		assert!(vars["intake_form"].contains("\"age\": 29"));
		assert_eq!(vars["goals"], "sleep better");
		assert!(!vars["diag"].contains("[session"));
	}

	#[test]
	fn case_vars_render_every_session() {
		let case = sample_case("c9", &[Stage::CaseConceptualization, Stage::Consolidation]);
		let vars = prompt_vars(&EvalTarget::Case(&case));
		assert_eq!(vars["intake_form"], "{}");
		assert!(vars["diag"].contains("[session 1 · case_conceptualization]"));
		assert!(vars["diag"].contains("[session 2 · consolidation]"));
		assert_eq!(vars["stage"], "case_conceptualization, consolidation");
	}
}
