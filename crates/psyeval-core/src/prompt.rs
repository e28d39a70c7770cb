//! Rubric prompt templates and transcript rendering.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use psyeval_types::{Case, Role, Session};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
	#[error("no prompt for rubric {rubric:?} criterion {criterion:?} (looked in {path:?})")]
	Missing {
		rubric: String,
		criterion: String,
		path: PathBuf,
	},
	#[error("failed to read prompt {path:?}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

fn placeholder_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("static regex"))
}

fn think_block_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"))
}

fn session_marker_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"^这是第\d+次会话$").expect("static regex"))
}

/// Values substituted into `{{ name }}` placeholders.
pub type PromptVars = BTreeMap<&'static str, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
	text: String,
}

impl PromptTemplate {
	pub fn new(text: impl Into<String>) -> Self {
		Self { text: text.into() }
	}

	pub fn text(&self) -> &str {
		&self.text
	}

	/// Unknown placeholders render as empty text.
	pub fn render(&self, vars: &PromptVars) -> String {
		placeholder_re()
			.replace_all(&self.text, |caps: &regex::Captures<'_>| {
				vars.get(&caps[1]).cloned().unwrap_or_default()
			})
			.into_owned()
	}
}

/// Where rubric prompt text comes from: `<root>/<rubric>/<criterion>.txt`, or memory.
#[derive(Debug, Clone)]
pub enum PromptLibrary {
	Dir(PathBuf),
	Memory(HashMap<(String, String), String>),
}

impl PromptLibrary {
	pub fn from_dir(root: impl Into<PathBuf>) -> Self {
		PromptLibrary::Dir(root.into())
	}

	pub fn in_memory<I, R, C, T>(entries: I) -> Self
	where
		I: IntoIterator<Item = (R, C, T)>,
		R: Into<String>,
		C: Into<String>,
		T: Into<String>,
	{
		PromptLibrary::Memory(
			entries
				.into_iter()
				.map(|(r, c, t)| ((r.into(), c.into()), t.into()))
				.collect(),
		)
	}

	pub fn load(&self, rubric: &str, criterion: &str) -> Result<PromptTemplate, PromptError> {
		match self {
			PromptLibrary::Dir(root) => load_file(root, rubric, criterion),
			PromptLibrary::Memory(map) => map
				.get(&(rubric.to_string(), criterion.to_string()))
				.map(|t| PromptTemplate::new(t.clone()))
				.ok_or_else(|| PromptError::Missing {
					rubric: rubric.to_string(),
					criterion: criterion.to_string(),
					path: PathBuf::from("<memory>"),
				}),
		}
	}
}

fn load_file(root: &Path, rubric: &str, criterion: &str) -> Result<PromptTemplate, PromptError> {
	let path = root.join(rubric).join(format!("{criterion}.txt"));
	match std::fs::read_to_string(&path) {
		Ok(text) => Ok(PromptTemplate::new(text)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PromptError::Missing {
			rubric: rubric.to_string(),
			criterion: criterion.to_string(),
			path,
		}),
		Err(source) => Err(PromptError::Io { path, source }),
	}
}

/// Removes `<think>` reasoning blocks and stray end markers from model text.
pub fn strip_think_blocks(text: &str) -> String {
	let text = text.replace("</end>", "");
	think_block_re().replace_all(&text, "").trim().to_string()
}

/// `counselor: …` / `client: …` lines; system turns and session markers are dropped.
pub fn render_session(session: &Session) -> String {
	let mut lines = Vec::with_capacity(session.turns.len());
	for turn in &session.turns {
		let text = turn.text.trim();
		match turn.role {
			Role::System => continue,
			Role::Counselor => lines.push(format!("counselor: {}", strip_think_blocks(text))),
			Role::Client => {
				if session_marker_re().is_match(text) {
					continue;
				}
				lines.push(format!("client: {text}"));
			}
		}
	}
	lines.join("\n")
}

/// All sessions of a case, each introduced by an index and stage header.
pub fn render_case(case: &Case) -> String {
	case.sessions
		.iter()
		.map(|s| format!("[session {} · {}]\n{}", s.index, s.stage, render_session(s)))
		.collect::<Vec<_>>()
		.join("\n\n")
}

#[cfg(test)]
mod tests {
	use super::*;
	use psyeval_types::{Stage, Turn};

	#[test]
	fn placeholders_render_with_or_without_spaces() {
		let template = PromptTemplate::new("Intake: {{ intake_form }}\nDialogue:\n{{diag}}\n{{ unknown }}!");
		let mut vars = PromptVars::new();
		vars.insert("intake_form", "{}".into());
		vars.insert("diag", "client: hi".into());
		assert_eq!(template.render(&vars), "Intake: {}\nDialogue:\nclient: hi\n!");
	}

	#[test]
	fn transcript_drops_system_turns_markers_and_think_blocks() {
		let session = Session::new(
			1,
			Stage::CaseConceptualization,
			vec![
				Turn { role: Role::System, text: "You are a counselor.".into() },
				Turn::client("这是第1次会话"),
				Turn::counselor("<think>plan the opening</think>Welcome back.</end>"),
				Turn::client("I slept badly."),
			],
		);
		assert_eq!(render_session(&session), "counselor: Welcome back.\nclient: I slept badly.");
	}

	#[test]
	fn memory_library_reports_missing_prompts() {
		let library = PromptLibrary::in_memory([("miti", "empathy", "Rate empathy: {{diag}}")]);
		assert!(library.load("miti", "empathy").is_ok());
		assert!(matches!(library.load("miti", "partnership"), Err(PromptError::Missing { .. })));
	}

	#[test]
	fn dir_library_reads_criterion_files() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("tes")).unwrap();
		std::fs::write(dir.path().join("tes").join("warmth.txt"), "Warmth? {{diag}}").unwrap();
		let library = PromptLibrary::from_dir(dir.path());
		assert_eq!(library.load("tes", "warmth").unwrap().text(), "Warmth? {{diag}}");
		assert!(library.load("tes", "concern").is_err());
	}
}
