//! Shared data model for psyeval: counseling cases, score and failure
//! records, and the aggregated reports built from them.

mod case;
mod record;
mod report;

use tabled::{Table, Tabled};

pub use case::{Case, Role, Session, Stage, TherapySchool, Turn};
pub use record::{
	FailureKind, FailureRecord, Granularity, MetricDescriptor, OutputShape, ScoreRecord, ScoreValue,
	Target, UnitOutcome, WeightingPolicy,
};
pub use report::{
	CaseReport, CorpusReport, EvalRun, GroupSummary, MetricAggregate, MetricSummary, RunStats,
	StageSummary,
};

#[derive(Debug, Clone, Tabled)]
struct CaseRow {
	case: String,
	school: String,
	coverage: String,
	composite: String,
	failures: usize,
	status: String,
}

#[derive(Debug, Clone, Tabled)]
struct MetricRow {
	metric: String,
	coverage: String,
	summary: String,
}

impl EvalRun {
	/// Renders one row per case followed by the corpus metric table.
	pub fn summary_table(&self) -> String {
		let rows: Vec<CaseRow> = self
			.cases
			.iter()
			.map(|cr| CaseRow {
				case: truncate(cr.case_id.clone(), 32),
				school: cr.school.to_string(),
				coverage: format!("{:.1}%", cr.coverage * 100.0),
				composite: cr
					.composite
					.map(|c| format!("{c:.3}"))
					.unwrap_or_else(|| "-".to_string()),
				failures: cr.failures.len(),
				status: if cr.complete { "✓".to_string() } else { "partial".to_string() },
			})
			.collect();

		let metric_rows: Vec<MetricRow> = self
			.corpus
			.metrics
			.iter()
			.map(|m| MetricRow {
				metric: m.metric.clone(),
				coverage: format!("{:.1}%", m.coverage * 100.0),
				summary: truncate(aggregate_preview(m.aggregate.as_ref()), 64),
			})
			.collect();

		let stats = &self.corpus.stats;
		let summary_text = format!(
			"Cases: {}  Complete: {}  Partial: {}  Rejected: {}  Units ok/failed: {}/{}  Coverage: {:.1}%",
			stats.cases,
			stats.completed,
			stats.incomplete,
			stats.rejected,
			stats.units_succeeded,
			stats.units_failed,
			self.corpus.coverage * 100.0
		);

		format!("{}\n\n{}\n\n{}\n", Table::new(rows), Table::new(metric_rows), summary_text)
	}
}

fn aggregate_preview(aggregate: Option<&MetricAggregate>) -> String {
	match aggregate {
		None => "no successful units".to_string(),
		Some(MetricAggregate::Scalar { mean, stdev, count, .. }) => {
			format!("mean {mean:.3} ± {stdev:.3} (n={count})")
		}
		Some(MetricAggregate::Subscales { means, .. }) => means
			.iter()
			.map(|(k, v)| format!("{k}={v:.2}"))
			.collect::<Vec<_>>()
			.join(" "),
		Some(MetricAggregate::Categorical { mode, count, .. }) => {
			format!("mode {} (n={count})", mode.as_deref().unwrap_or("-"))
		}
	}
}

fn truncate(s: String, max_len: usize) -> String {
	if s.chars().count() <= max_len {
		return s;
	}
	let mut truncated = s.chars().take(max_len.saturating_sub(1)).collect::<String>();
	truncated.push('…');
	truncated
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn truncate_counts_characters() {
		assert_eq!(truncate("会话记录".to_string(), 3), "会话…");
		assert_eq!(truncate("short".to_string(), 10), "short");
	}

	#[test]
	fn preview_marks_gaps() {
		assert_eq!(aggregate_preview(None), "no successful units");
	}
}
