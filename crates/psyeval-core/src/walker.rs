//! Stage-ordered traversal of a case's sessions with a bounded running
//! digest of what came before.

use std::collections::VecDeque;

use psyeval_types::{Case, Role, Session, Stage};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
	#[error("session {index} is labelled {stage} but follows a {previous} session")]
	StageOrder { index: u32, stage: Stage, previous: Stage },
	#[error("session index {index} does not follow session {previous}")]
	IndexOrder { index: u32, previous: u32 },
	#[error("case has no sessions to evaluate per session")]
	NoSessions,
}

/// Compact summary of one earlier session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDigest {
	pub index: u32,
	pub stage: Stage,
	pub turns: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_client: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_counselor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionContext {
	pub case_id: String,
	/// 0-based position of the session in the case.
	pub position: usize,
	pub total_sessions: usize,
	pub stage: Stage,
	/// Up to `window` earlier sessions, oldest first.
	pub prior: Vec<SessionDigest>,
}

impl SessionContext {
	/// Plain-text rendering of the prior-session digest for prompts.
	pub fn history_text(&self) -> String {
		if self.prior.is_empty() {
			return "(no prior sessions)".to_string();
		}
		let mut out = String::new();
		for d in &self.prior {
			out.push_str(&format!("[session {} · {} · {} turns]\n", d.index, d.stage, d.turns));
			if let Some(c) = &d.last_client {
				out.push_str(&format!("client: {c}\n"));
			}
			if let Some(c) = &d.last_counselor {
				out.push_str(&format!("counselor: {c}\n"));
			}
		}
		out.trim_end().to_string()
	}
}

#[derive(Debug, Clone)]
pub struct CaseWalker {
	window: usize,
	excerpt_chars: usize,
}

impl Default for CaseWalker {
	fn default() -> Self {
		Self::new(3)
	}
}

impl CaseWalker {
	pub fn new(window: usize) -> Self {
		Self { window, excerpt_chars: 240 }
	}

	pub fn with_excerpt_chars(mut self, chars: usize) -> Self {
		self.excerpt_chars = chars;
		self
	}

	pub fn window(&self) -> usize {
		self.window
	}

	/// Stages must be non-decreasing and indices strictly increasing.
	pub fn validate(&self, case: &Case) -> Result<(), IntegrityError> {
		for pair in case.sessions.windows(2) {
			let (prev, next) = (&pair[0], &pair[1]);
			if next.stage < prev.stage {
				return Err(IntegrityError::StageOrder {
					index: next.index,
					stage: next.stage,
					previous: prev.stage,
				});
			}
			if next.index <= prev.index {
				return Err(IntegrityError::IndexOrder { index: next.index, previous: prev.index });
			}
		}
		Ok(())
	}

	pub fn walk<'a>(&self, case: &'a Case) -> Result<Walk<'a>, IntegrityError> {
		self.validate(case)?;
		Ok(Walk {
			case,
			position: 0,
			window: self.window,
			excerpt_chars: self.excerpt_chars,
			recent: VecDeque::with_capacity(self.window),
		})
	}
}

/// Lazy `(session, context)` sequence over one validated case.
pub struct Walk<'a> {
	case: &'a Case,
	position: usize,
	window: usize,
	excerpt_chars: usize,
	recent: VecDeque<SessionDigest>,
}

impl<'a> Iterator for Walk<'a> {
	type Item = (&'a Session, SessionContext);

	fn next(&mut self) -> Option<Self::Item> {
		let session = self.case.sessions.get(self.position)?;
		let context = SessionContext {
			case_id: self.case.id.clone(),
			position: self.position,
			total_sessions: self.case.sessions.len(),
			stage: session.stage,
			prior: self.recent.iter().cloned().collect(),
		};

		if self.window > 0 {
			if self.recent.len() == self.window {
				self.recent.pop_front();
			}
			self.recent.push_back(digest(session, self.excerpt_chars));
		}
		self.position += 1;
		Some((session, context))
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		let left = self.case.sessions.len() - self.position;
		(left, Some(left))
	}
}

fn digest(session: &Session, excerpt_chars: usize) -> SessionDigest {
	let excerpt = |role| session.last_utterance(role).map(|t| clip(t, excerpt_chars));
	SessionDigest {
		index: session.index,
		stage: session.stage,
		turns: session.turns.len(),
		last_client: excerpt(Role::Client),
		last_counselor: excerpt(Role::Counselor),
	}
}

fn clip(text: &str, max_chars: usize) -> String {
	let text = text.trim();
	if text.chars().count() <= max_chars {
		return text.to_string();
	}
	let mut clipped: String = text.chars().take(max_chars.saturating_sub(1)).collect();
	clipped.push('…');
	clipped
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::sample_case;
	use psyeval_types::Stage::*;

	const FOUR_STAGES: [Stage; 4] =
		[CaseConceptualization, CoreIntervention, CoreIntervention, Consolidation];

	fn contexts(case: &Case, window: usize) -> Vec<SessionContext> {
		CaseWalker::new(window).walk(case).unwrap().map(|(_, c)| c).collect()
	}

	#[test]
	fn rewalking_yields_identical_sequence() {
		let case = sample_case("c1", &FOUR_STAGES);
		let walker = CaseWalker::new(2);
		let indexed = |w: &CaseWalker| -> Vec<_> {
			w.walk(&case).unwrap().map(|(s, c)| (s.index, c)).collect()
		};
		let first = indexed(&walker);
		let second = indexed(&walker);
		assert_eq!(first, second);
		assert_eq!(first.len(), 4);
	}

	#[test]
	fn context_window_is_bounded_and_ordered() {
		let case = sample_case("c1", &FOUR_STAGES);
		let contexts = contexts(&case, 2);

		assert!(contexts[0].prior.is_empty());
		assert_eq!(contexts[1].prior.len(), 1);
		let last: Vec<u32> = contexts[3].prior.iter().map(|d| d.index).collect();
		assert_eq!(last, vec![2, 3]);
		assert_eq!(contexts[3].stage, Consolidation);
		assert_eq!(contexts[3].total_sessions, 4);
	}

	#[test]
	fn out_of_order_stages_fail_validation() {
		let case = sample_case("c2", &[Consolidation, CaseConceptualization]);
		let err = CaseWalker::default().walk(&case).err().unwrap();
		assert_eq!(
			err,
			IntegrityError::StageOrder {
				index: 2,
				stage: CaseConceptualization,
				previous: Consolidation,
			}
		);
	}

	#[test]
	fn duplicate_session_index_fails_validation() {
		let mut case = sample_case("c3", &[CaseConceptualization, CoreIntervention]);
		case.sessions[1].index = case.sessions[0].index;
		let err = CaseWalker::default().validate(&case).unwrap_err();
		assert!(matches!(err, IntegrityError::IndexOrder { .. }));
	}

	#[test]
	fn zero_window_carries_no_history() {
		let case = sample_case("c4", &[CaseConceptualization, CoreIntervention]);
		let contexts = contexts(&case, 0);
		assert!(contexts.iter().all(|c| c.prior.is_empty()));
		assert_eq!(contexts[1].history_text(), "(no prior sessions)");
	}

	#[test]
	fn long_utterances_are_clipped() {
		assert_eq!(clip("abcdef", 4), "abc…");
		assert_eq!(clip("  abc ", 4), "abc");
	}
}
