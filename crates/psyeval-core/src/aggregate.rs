//! Turns unit outcomes into case reports and case reports into a corpus
//! report. Aggregation never fails and never imputes missing units.

use std::collections::BTreeMap;

use chrono::Utc;
use psyeval_types::{
	Case, CaseReport, CorpusReport, FailureKind, FailureRecord, GroupSummary, Granularity,
	MetricAggregate, MetricSummary, OutputShape, RunStats, ScoreRecord, ScoreValue, Stage,
	StageSummary, Target, TherapySchool, UnitOutcome, WeightingPolicy,
};

use crate::registry::MetricSpec;

/// Builds the report for one case from its terminal unit outcomes.
pub fn aggregate(
	case: &Case,
	specs: &[MetricSpec],
	outcomes: Vec<UnitOutcome>,
	complete: bool,
) -> CaseReport {
	let mut scores = Vec::new();
	let mut failures = Vec::new();
	for outcome in outcomes {
		match outcome {
			UnitOutcome::Succeeded(score) => scores.push(score),
			UnitOutcome::Failed(failure) => failures.push(failure),
		}
	}

	let rank = |metric: Option<&str>| {
		metric.and_then(|m| specs.iter().position(|s| s.descriptor.name == m))
	};
	scores.sort_by(|a, b| {
		(rank(Some(a.metric.as_str())), a.target).cmp(&(rank(Some(b.metric.as_str())), b.target))
	});
	failures.sort_by(|a, b| {
		(rank(a.metric.as_deref()), a.target, a.kind.as_str(), &a.message)
			.cmp(&(rank(b.metric.as_deref()), b.target, b.kind.as_str(), &b.message))
	});

	// A case rejected by the walker ran no units; its metrics count every target as failed.
	let blocked = failures
		.iter()
		.any(|f| f.metric.is_none() && f.kind == FailureKind::DataIntegrity);

	let metrics: Vec<MetricSummary> = specs
		.iter()
		.map(|spec| {
			let values: Vec<&ScoreValue> = scores
				.iter()
				.filter(|s| s.metric == spec.descriptor.name)
				.map(|s| &s.value)
				.collect();
			let mut failed = failures
				.iter()
				.filter(|f| f.metric.as_deref() == Some(spec.descriptor.name.as_str()))
				.count();
			if blocked {
				failed += planned_targets(case, spec);
			}
			summarize(spec, &values, failed)
		})
		.collect();

	let stages = stage_summaries(case, specs, &scores, &failures, blocked);
	let succeeded = scores.len();
	let coverage = ratio(succeeded, succeeded + failures.len());
	let composite = composite(specs, &metrics);

	CaseReport {
		case_id: case.id.clone(),
		school: case.school,
		scores,
		failures,
		metrics,
		stages,
		coverage,
		composite,
		complete,
	}
}

/// Units a metric would have produced for the case, never fewer than one.
fn planned_targets(case: &Case, spec: &MetricSpec) -> usize {
	match spec.descriptor.granularity {
		Granularity::PerSession => case.sessions.len().max(1),
		Granularity::PerCase => 1,
	}
}

/// Per-session metric results grouped by the stage of their session.
fn stage_summaries(
	case: &Case,
	specs: &[MetricSpec],
	scores: &[ScoreRecord],
	failures: &[FailureRecord],
	blocked: bool,
) -> Vec<StageSummary> {
	let per_session: Vec<&MetricSpec> = specs
		.iter()
		.filter(|s| s.descriptor.granularity == Granularity::PerSession)
		.collect();
	if per_session.is_empty() {
		return Vec::new();
	}

	let stage_of = |target: Target| match target {
		Target::Session(index) => case.session(index).map(|s| s.stage),
		Target::Case => None,
	};

	let mut present: Vec<Stage> = case.sessions.iter().map(|s| s.stage).collect();
	present.sort();
	present.dedup();

	present
		.into_iter()
		.map(|stage| {
			let metrics = per_session
				.iter()
				.map(|spec| {
					let name = spec.descriptor.name.as_str();
					let values: Vec<&ScoreValue> = scores
						.iter()
						.filter(|s| s.metric == name && stage_of(s.target) == Some(stage))
						.map(|s| &s.value)
						.collect();
					let mut failed = failures
						.iter()
						.filter(|f| {
							f.metric.as_deref() == Some(name) && stage_of(f.target) == Some(stage)
						})
						.count();
					if blocked {
						failed += case.sessions.iter().filter(|s| s.stage == stage).count();
					}
					summarize(spec, &values, failed)
				})
				.collect();
			StageSummary { stage, metrics }
		})
		.collect()
}

fn summarize(spec: &MetricSpec, values: &[&ScoreValue], failed: usize) -> MetricSummary {
	let succeeded = values.len();
	let aggregate = if succeeded == 0 {
		None
	} else {
		Some(match &spec.descriptor.shape {
			OutputShape::Scalar { .. } => {
				let xs: Vec<f64> = values.iter().filter_map(|v| v.as_scalar()).collect();
				scalar_stats(&xs)
			}
			OutputShape::Subscales { names, .. } => {
				let means = names
					.iter()
					.map(|name| {
						let xs: Vec<f64> = values
							.iter()
							.filter_map(|v| match v {
								ScoreValue::Subscales(m) => m.get(name).copied(),
								_ => None,
							})
							.collect();
						(name.clone(), mean(&xs))
					})
					.collect();
				MetricAggregate::Subscales { count: succeeded, means }
			}
			OutputShape::Categorical { labels } => {
				let mut counts: BTreeMap<String, usize> =
					labels.iter().map(|l| (l.clone(), 0)).collect();
				for v in values {
					if let ScoreValue::Category(label) = v {
						*counts.entry(label.clone()).or_default() += 1;
					}
				}
				categorical_from_counts(labels, succeeded, counts)
			}
		})
	};

	MetricSummary {
		metric: spec.descriptor.name.clone(),
		weight: spec.options.weight,
		weighting: spec.options.weighting,
		succeeded,
		failed,
		coverage: ratio(succeeded, succeeded + failed),
		aggregate,
	}
}

fn scalar_stats(xs: &[f64]) -> MetricAggregate {
	let m = mean(xs);
	let variance = if xs.is_empty() {
		0.0
	} else {
		xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64
	};
	MetricAggregate::Scalar {
		count: xs.len(),
		mean: m,
		variance,
		stdev: variance.sqrt(),
	}
}

fn categorical_from_counts(
	labels: &[String],
	count: usize,
	counts: BTreeMap<String, usize>,
) -> MetricAggregate {
	let total: usize = counts.values().sum();
	let shares = counts
		.iter()
		.map(|(label, n)| (label.clone(), ratio(*n, total)))
		.collect::<BTreeMap<_, _>>();
	MetricAggregate::Categorical {
		count,
		mode: mode(labels, &shares),
		shares,
		counts,
	}
}

/// Highest share; ties go to the label declared first.
fn mode(labels: &[String], shares: &BTreeMap<String, f64>) -> Option<String> {
	let mut best: Option<(&String, f64)> = None;
	for label in labels {
		let share = shares.get(label).copied().unwrap_or(0.0);
		if share > 0.0 && best.map_or(true, |(_, b)| share > b) {
			best = Some((label, share));
		}
	}
	best.map(|(l, _)| l.clone())
}

/// Weighted mean of scalar metric means, each scaled to [0, 1] by its range.
fn composite(specs: &[MetricSpec], metrics: &[MetricSummary]) -> Option<f64> {
	let mut weighted = 0.0;
	let mut weights = 0.0;
	for (spec, summary) in specs.iter().zip(metrics) {
		if let (OutputShape::Scalar { min, max }, Some(MetricAggregate::Scalar { mean, .. })) =
			(&spec.descriptor.shape, &summary.aggregate)
		{
			if max > min {
				weighted += spec.options.weight * (mean - min) / (max - min);
				weights += spec.options.weight;
			}
		}
	}
	(weights > 0.0).then(|| weighted / weights)
}

/// Merges case reports into the corpus report.
///
/// Reports are merged in case-id order, so the input order does not matter.
pub fn aggregate_corpus(
	reports: &[CaseReport],
	rejected: Vec<FailureRecord>,
	specs: &[MetricSpec],
) -> CorpusReport {
	let mut ordered: Vec<&CaseReport> = reports.iter().collect();
	ordered.sort_by(|a, b| a.case_id.cmp(&b.case_id));

	let metrics = merge_group(specs, ordered.iter().map(|r| r.metrics.as_slice()));

	let mut by_school: BTreeMap<TherapySchool, Vec<&CaseReport>> = BTreeMap::new();
	for report in &ordered {
		by_school.entry(report.school).or_default().push(report);
	}
	let schools = by_school
		.into_iter()
		.map(|(key, group)| GroupSummary {
			key,
			cases: group.len(),
			metrics: merge_group(specs, group.iter().map(|r| r.metrics.as_slice())),
		})
		.collect();

	let stage_specs: Vec<MetricSpec> = specs
		.iter()
		.filter(|s| s.descriptor.granularity == Granularity::PerSession)
		.cloned()
		.collect();
	let stages = Stage::ALL
		.iter()
		.filter_map(|stage| {
			let group: Vec<&[MetricSummary]> = ordered
				.iter()
				.filter_map(|r| r.stages.iter().find(|s| s.stage == *stage))
				.map(|s| s.metrics.as_slice())
				.collect();
			(!group.is_empty()).then(|| GroupSummary {
				key: *stage,
				cases: group.len(),
				metrics: merge_group(&stage_specs, group.into_iter()),
			})
		})
		.collect();

	let units_succeeded: usize = ordered.iter().map(|r| r.scores.len()).sum();
	let units_failed: usize = ordered.iter().map(|r| r.failures.len()).sum();
	let completed = ordered.iter().filter(|r| r.complete).count();
	let stats = RunStats {
		cases: ordered.len(),
		completed,
		incomplete: ordered.len() - completed,
		rejected: rejected.len(),
		units_succeeded,
		units_failed,
	};

	CorpusReport {
		generated_at: Utc::now(),
		coverage: ratio(units_succeeded, units_succeeded + units_failed),
		composite: composite(specs, &metrics),
		metrics,
		schools,
		stages,
		stats,
		rejected,
	}
}

fn merge_group<'a, I>(specs: &[MetricSpec], cases: I) -> Vec<MetricSummary>
where
	I: Iterator<Item = &'a [MetricSummary]>,
{
	let cases: Vec<&[MetricSummary]> = cases.collect();
	specs
		.iter()
		.map(|spec| {
			let parts: Vec<&MetricSummary> = cases
				.iter()
				.filter_map(|summaries| summaries.iter().find(|m| m.metric == spec.descriptor.name))
				.collect();
			merge(spec, &parts)
		})
		.collect()
}

/// Merges one metric's case summaries.
///
/// `per_case`: each case with results counts once (aggregates over case
/// means, `count` is the number of cases). `per_unit`: units are pooled,
/// which reproduces the statistics of all units taken together.
fn merge(spec: &MetricSpec, parts: &[&MetricSummary]) -> MetricSummary {
	let succeeded: usize = parts.iter().map(|p| p.succeeded).sum();
	let failed: usize = parts.iter().map(|p| p.failed).sum();
	let aggregates: Vec<&MetricAggregate> =
		parts.iter().filter_map(|p| p.aggregate.as_ref()).collect();

	let aggregate = if aggregates.is_empty() {
		None
	} else {
		match spec.options.weighting {
			WeightingPolicy::PerCase => merge_per_case(&spec.descriptor.shape, &aggregates),
			WeightingPolicy::PerUnit => merge_per_unit(&spec.descriptor.shape, &aggregates),
		}
	};

	MetricSummary {
		metric: spec.descriptor.name.clone(),
		weight: spec.options.weight,
		weighting: spec.options.weighting,
		succeeded,
		failed,
		coverage: ratio(succeeded, succeeded + failed),
		aggregate,
	}
}

fn merge_per_case(shape: &OutputShape, parts: &[&MetricAggregate]) -> Option<MetricAggregate> {
	match shape {
		OutputShape::Scalar { .. } => {
			let means: Vec<f64> = parts.iter().filter_map(|a| a.mean()).collect();
			(!means.is_empty()).then(|| scalar_stats(&means))
		}
		OutputShape::Subscales { names, .. } => {
			let case_means: Vec<&BTreeMap<String, f64>> = parts
				.iter()
				.filter_map(|a| match a {
					MetricAggregate::Subscales { means, .. } => Some(means),
					_ => None,
				})
				.collect();
			let means = names
				.iter()
				.map(|n| {
					let xs: Vec<f64> =
						case_means.iter().filter_map(|m| m.get(n).copied()).collect();
					(n.clone(), mean(&xs))
				})
				.collect();
			Some(MetricAggregate::Subscales { count: case_means.len(), means })
		}
		OutputShape::Categorical { labels } => {
			let mut cases = 0usize;
			let mut share_sums: BTreeMap<String, f64> =
				labels.iter().map(|l| (l.clone(), 0.0)).collect();
			let mut counts: BTreeMap<String, usize> =
				labels.iter().map(|l| (l.clone(), 0)).collect();
			for part in parts {
				if let MetricAggregate::Categorical { shares, counts: c, .. } = part {
					cases += 1;
					for (label, share) in shares {
						*share_sums.entry(label.clone()).or_default() += share;
					}
					for (label, n) in c {
						*counts.entry(label.clone()).or_default() += n;
					}
				}
			}
			let shares: BTreeMap<String, f64> = share_sums
				.into_iter()
				.map(|(l, s)| (l, if cases == 0 { 0.0 } else { s / cases as f64 }))
				.collect();
			Some(MetricAggregate::Categorical {
				count: cases,
				mode: mode(labels, &shares),
				shares,
				counts,
			})
		}
	}
}

fn merge_per_unit(shape: &OutputShape, parts: &[&MetricAggregate]) -> Option<MetricAggregate> {
	match shape {
		OutputShape::Scalar { .. } => {
			let mut n = 0usize;
			let mut sum = 0.0;
			for part in parts {
				if let MetricAggregate::Scalar { count, mean, .. } = part {
					n += count;
					sum += *count as f64 * mean;
				}
			}
			if n == 0 {
				return None;
			}
			let pooled = sum / n as f64;
			// Within-case variance plus the spread of case means around the pooled mean.
			let mut sq = 0.0;
			for part in parts {
				if let MetricAggregate::Scalar { count, mean, variance, .. } = part {
					sq += *count as f64 * (variance + (mean - pooled).powi(2));
				}
			}
			let variance = sq / n as f64;
			Some(MetricAggregate::Scalar {
				count: n,
				mean: pooled,
				variance,
				stdev: variance.sqrt(),
			})
		}
		OutputShape::Subscales { names, .. } => {
			let mut n = 0usize;
			let mut sums: BTreeMap<String, f64> = names.iter().map(|k| (k.clone(), 0.0)).collect();
			for part in parts {
				if let MetricAggregate::Subscales { count, means } = part {
					n += count;
					for (k, v) in means {
						*sums.entry(k.clone()).or_default() += *count as f64 * v;
					}
				}
			}
			let means = sums
				.into_iter()
				.map(|(k, s)| (k, if n == 0 { 0.0 } else { s / n as f64 }))
				.collect();
			Some(MetricAggregate::Subscales { count: n, means })
		}
		OutputShape::Categorical { labels } => {
			let mut n = 0usize;
			let mut counts: BTreeMap<String, usize> =
				labels.iter().map(|l| (l.clone(), 0)).collect();
			for part in parts {
				if let MetricAggregate::Categorical { count, counts: c, .. } = part {
					n += count;
					for (label, k) in c {
						*counts.entry(label.clone()).or_default() += k;
					}
				}
			}
			Some(categorical_from_counts(labels, n, counts))
		}
	}
}

fn mean(xs: &[f64]) -> f64 {
	if xs.is_empty() {
		0.0
	} else {
		xs.iter().sum::<f64>() / xs.len() as f64
	}
}

/// `part / total`, or 0 when there is nothing to divide.
fn ratio(part: usize, total: usize) -> f64 {
	if total == 0 {
		0.0
	} else {
		part as f64 / total as f64
	}
}
