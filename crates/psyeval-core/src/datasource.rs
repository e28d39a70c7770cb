use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use psyeval_types::{Case, FailureRecord};
use serde_json::Value;
use tracing::warn;

/// A case input that could not be turned into a [`Case`].
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedCase {
	/// Case id when the input carried one, otherwise its location.
	pub source: String,
	pub reason: String,
}

impl RejectedCase {
	pub fn into_failure(self) -> FailureRecord {
		FailureRecord::integrity(self.source, self.reason)
	}
}

pub type CaseInput = std::result::Result<Case, RejectedCase>;

/// Yields the corpus. `Err` is reserved for failing to open the corpus
/// itself; bad entries come back as rejected inputs.
#[async_trait]
pub trait CaseSource: Send + Sync {
	async fn load(&self) -> Result<Vec<CaseInput>>;
}

pub struct VecCaseSource {
	cases: Vec<Case>,
}

impl VecCaseSource {
	pub fn new(cases: Vec<Case>) -> Self {
		Self { cases }
	}
}

#[async_trait]
impl CaseSource for VecCaseSource {
	async fn load(&self) -> Result<Vec<CaseInput>> {
		Ok(self.cases.iter().cloned().map(Ok).collect())
	}
}

/// One case document per line.
pub struct JsonlCaseSource {
	path: PathBuf,
}

impl JsonlCaseSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

#[async_trait]
impl CaseSource for JsonlCaseSource {
	async fn load(&self) -> Result<Vec<CaseInput>> {
		let content = tokio_fs_read_to_string(&self.path).await?;
		let mut cases = Vec::new();
		for (idx, line) in content.lines().enumerate() {
			let line = line.trim();
			if line.is_empty() {
				continue;
			}
			let input = parse_case(line, || format!("line {}", idx + 1));
			if let Err(rejected) = &input {
				warn!(source = %rejected.source, reason = %rejected.reason, "rejected case input");
			}
			cases.push(input);
		}
		Ok(cases)
	}
}

/// Every `*.json` file in a directory, one case per file, in file-name order.
pub struct JsonDirCaseSource {
	dir: PathBuf,
}

impl JsonDirCaseSource {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}
}

#[async_trait]
impl CaseSource for JsonDirCaseSource {
	async fn load(&self) -> Result<Vec<CaseInput>> {
		let mut entries = tokio::fs::read_dir(&self.dir)
			.await
			.with_context(|| format!("Failed to read directory {:?}", self.dir))?;
		let mut files = Vec::new();
		while let Some(entry) = entries
			.next_entry()
			.await
			.with_context(|| format!("Failed to list {:?}", self.dir))?
		{
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) == Some("json") {
				files.push(path);
			}
		}
		files.sort();

		let mut cases = Vec::with_capacity(files.len());
		for path in files {
			let name = file_name(&path);
			let input = match tokio_fs_read_to_string(&path).await {
				Ok(content) => parse_case(&content, || name.clone()),
				Err(e) => Err(RejectedCase { source: name.clone(), reason: format!("{e:#}") }),
			};
			if let Err(rejected) = &input {
				warn!(source = %rejected.source, reason = %rejected.reason, "rejected case input");
			}
			cases.push(input);
		}
		Ok(cases)
	}
}

/// Picks a source by path: directories are read file by file, anything
/// else as JSONL.
pub async fn open_source(path: impl AsRef<Path>) -> Result<Box<dyn CaseSource>> {
	let path = path.as_ref();
	let meta = tokio::fs::metadata(path)
		.await
		.with_context(|| format!("Failed to open corpus {:?}", path))?;
	if meta.is_dir() {
		Ok(Box::new(JsonDirCaseSource::new(path)))
	} else {
		Ok(Box::new(JsonlCaseSource::new(path)))
	}
}

fn parse_case(text: &str, location: impl Fn() -> String) -> CaseInput {
	let value: Value = serde_json::from_str(text).map_err(|e| RejectedCase {
		source: location(),
		reason: format!("invalid JSON: {e}"),
	})?;
	let source = value
		.get("id")
		.and_then(|v| v.as_str())
		.map(str::to_string)
		.unwrap_or_else(&location);
	serde_json::from_value(value).map_err(|e| RejectedCase { source, reason: e.to_string() })
}

fn file_name(path: &Path) -> String {
	path.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_else(|| path.display().to_string())
}

#[cfg(not(feature = "sync-fs"))]
async fn tokio_fs_read_to_string(path: &Path) -> Result<String> {
	use tokio::fs;
	fs::read_to_string(path)
		.await
		.with_context(|| format!("Failed to read {:?}", path))
}

#[cfg(feature = "sync-fs")]
async fn tokio_fs_read_to_string(path: &Path) -> Result<String> {
	use std::fs;
	use tokio::task;
	let path_clone = path.to_path_buf();
	let content = task::spawn_blocking(move || {
		fs::read_to_string(&path_clone).with_context(|| format!("Failed to read {:?}", path_clone))
	})
	.await
	.map_err(|e| anyhow::anyhow!(e))??;
	Ok(content)
}

#[cfg(test)]
mod tests {
	use super::*;
	use psyeval_types::{Stage, TherapySchool};

	const CASE_A: &str = r#"{"id": "a", "school": "CBT", "profile": {"age": 31}, "sessions": [{"index": 1, "stage": "initial_conceptualization", "turns": [{"role": "user", "text": "这是第1次会话"}, {"role": "assistant", "text": "Hello."}]}]}"#;

	#[tokio::test]
	async fn jsonl_rejects_bad_lines_without_failing() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("cases.jsonl");
		let content = format!("{CASE_A}\n\n{{not json\n{{\"id\": \"b\", \"school\": \"rogerian\"}}\n");
		std::fs::write(&path, content).unwrap();

		let inputs = JsonlCaseSource::new(&path).load().await.unwrap();
		assert_eq!(inputs.len(), 3);

		let case = inputs[0].as_ref().unwrap();
		assert_eq!(case.school, TherapySchool::Cbt);
		assert_eq!(case.sessions[0].stage, Stage::CaseConceptualization);

		let bad_json = inputs[1].as_ref().unwrap_err();
		assert_eq!(bad_json.source, "line 3");
		let bad_school = inputs[2].as_ref().unwrap_err();
		assert_eq!(bad_school.source, "b");
		assert!(bad_school.reason.contains("rogerian"));
	}

	#[tokio::test]
	async fn directory_source_reads_json_files_in_name_order() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("02.json"), CASE_A.replace("\"a\"", "\"second\"")).unwrap();
		std::fs::write(dir.path().join("01.json"), CASE_A.replace("\"a\"", "\"first\"")).unwrap();
		std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

		let inputs = open_source(dir.path()).await.unwrap().load().await.unwrap();
		let ids: Vec<&str> = inputs.iter().map(|c| c.as_ref().unwrap().id.as_str()).collect();
		assert_eq!(ids, vec!["first", "second"]);
	}

	#[tokio::test]
	async fn missing_corpus_is_an_error() {
		assert!(open_source("/definitely/not/here.jsonl").await.is_err());
	}

	#[test]
	fn rejected_input_becomes_integrity_failure() {
		let failure = RejectedCase { source: "line 4".into(), reason: "bad".into() }.into_failure();
		assert!(failure.metric.is_none());
		assert_eq!(failure.case_id, "line 4");
	}
}
