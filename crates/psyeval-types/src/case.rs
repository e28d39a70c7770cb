use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Clinical stage of a session. Declaration order is temporal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
	#[serde(alias = "conceptualization", alias = "initial_conceptualization")]
	CaseConceptualization,
	#[serde(alias = "intervention")]
	CoreIntervention,
	Consolidation,
}

impl Stage {
	pub const ALL: [Stage; 3] =
		[Stage::CaseConceptualization, Stage::CoreIntervention, Stage::Consolidation];

	pub fn as_str(&self) -> &'static str {
		match self {
			Stage::CaseConceptualization => "case_conceptualization",
			Stage::CoreIntervention => "core_intervention",
			Stage::Consolidation => "consolidation",
		}
	}
}

impl fmt::Display for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TherapySchool {
	/// Cognitive-behavioral therapy.
	#[serde(alias = "CBT")]
	Cbt,
	/// Humanistic-existential therapy.
	#[serde(alias = "HET")]
	Het,
	/// Psychodynamic therapy.
	#[serde(alias = "PDT")]
	Pdt,
}

impl TherapySchool {
	pub fn as_str(&self) -> &'static str {
		match self {
			TherapySchool::Cbt => "cbt",
			TherapySchool::Het => "het",
			TherapySchool::Pdt => "pdt",
		}
	}
}

impl fmt::Display for TherapySchool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	#[serde(alias = "assistant")]
	Counselor,
	#[serde(alias = "user")]
	Client,
	System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
	pub role: Role,
	pub text: String,
}

impl Turn {
	pub fn counselor(text: impl Into<String>) -> Self {
		Self { role: Role::Counselor, text: text.into() }
	}

	pub fn client(text: impl Into<String>) -> Self {
		Self { role: Role::Client, text: text.into() }
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
	pub index: u32,
	pub stage: Stage,
	#[serde(default)]
	pub turns: Vec<Turn>,
}

impl Session {
	pub fn new(index: u32, stage: Stage, turns: Vec<Turn>) -> Self {
		Self { index, stage, turns }
	}

	/// Last utterance spoken by `role`, if any.
	pub fn last_utterance(&self, role: Role) -> Option<&str> {
		self.turns
			.iter()
			.rev()
			.find(|t| t.role == role)
			.map(|t| t.text.as_str())
	}
}

/// One multi-session counseling record for one simulated client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
	pub id: String,
	pub school: TherapySchool,
	#[serde(default)]
	pub sessions: Vec<Session>,
	/// Client intake profile, kept as the document the corpus supplies.
	#[serde(default)]
	pub profile: Value,
	#[serde(default)]
	pub goals: Vec<String>,
}

impl Case {
	pub fn new(id: impl Into<String>, school: TherapySchool, sessions: Vec<Session>) -> Self {
		Self {
			id: id.into(),
			school,
			sessions,
			profile: Value::Null,
			goals: Vec::new(),
		}
	}

	pub fn with_profile(mut self, profile: Value) -> Self {
		self.profile = profile;
		self
	}

	pub fn with_goals<I, S>(mut self, goals: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.goals = goals.into_iter().map(Into::into).collect();
		self
	}

	pub fn session(&self, index: u32) -> Option<&Session> {
		self.sessions.iter().find(|s| s.index == index)
	}
}
