//! Run Statistics
//!
//! Aggregates index entries per workflow. Each entry is first classified
//! into an [`Outcome`]: entries that cannot contribute to a metric are
//! `Skipped` with a reason instead of aborting the aggregation.

use std::collections::BTreeMap;
use std::fmt;

use super::model::{RunIndexEntry, RunStatus};

/// Result of classifying one record for a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Valid(T),
    Skipped(SkipReason),
}

/// Why a record does not count towards a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFinished,
    NeverStarted,
    MissingDuration,
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFinished => write!(f, "run has not finished"),
            Self::NeverStarted => write!(f, "run never started"),
            Self::MissingDuration => write!(f, "run has no recorded duration"),
            Self::Cancelled => write!(f, "run was cancelled"),
        }
    }
}

/// Duration sample for a finished run that actually executed.
pub fn duration_sample(entry: &RunIndexEntry) -> Outcome<u64> {
    if !entry.status.is_terminal() {
        return Outcome::Skipped(SkipReason::NotFinished);
    }
    if entry.started_at.is_none() {
        return Outcome::Skipped(SkipReason::NeverStarted);
    }
    match entry.duration_ms {
        Some(ms) => Outcome::Valid(ms),
        None => Outcome::Skipped(SkipReason::MissingDuration),
    }
}

/// Success sample: `true` for completed, `false` for failed.
///
/// Cancelled runs say nothing about reliability and are skipped.
pub fn success_sample(entry: &RunIndexEntry) -> Outcome<bool> {
    match entry.status {
        RunStatus::Completed => Outcome::Valid(true),
        RunStatus::Failed => Outcome::Valid(false),
        RunStatus::Cancelled => Outcome::Skipped(SkipReason::Cancelled),
        RunStatus::Pending | RunStatus::Running => Outcome::Skipped(SkipReason::NotFinished),
    }
}

/// Aggregated figures for one workflow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowStats {
    pub workflow_id: String,
    pub workflow_name: String,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed / (completed + failed), when any finished
    pub success_rate: Option<f64>,
    pub average_duration_ms: Option<u64>,
    /// Entries left out of the duration average
    pub skipped: usize,
}

/// Summarizes entries per workflow id, ordered by workflow id.
pub fn summarize<'a, I>(entries: I) -> BTreeMap<String, WorkflowStats>
where
    I: IntoIterator<Item = &'a RunIndexEntry>,
{
    let mut acc: BTreeMap<String, (WorkflowStats, Vec<u64>, usize, usize)> = BTreeMap::new();

    for entry in entries {
        let (stats, durations, successes, judged) = acc
            .entry(entry.workflow_id.clone())
            .or_insert_with(|| {
                (
                    WorkflowStats {
                        workflow_id: entry.workflow_id.clone(),
                        workflow_name: entry.workflow_name.clone(),
                        ..WorkflowStats::default()
                    },
                    Vec::new(),
                    0,
                    0,
                )
            });

        stats.total += 1;
        match entry.status {
            RunStatus::Pending => stats.pending += 1,
            RunStatus::Running => stats.running += 1,
            RunStatus::Completed => stats.completed += 1,
            RunStatus::Failed => stats.failed += 1,
            RunStatus::Cancelled => stats.cancelled += 1,
        }

        match duration_sample(entry) {
            Outcome::Valid(ms) => durations.push(ms),
            Outcome::Skipped(_) => stats.skipped += 1,
        }

        if let Outcome::Valid(ok) = success_sample(entry) {
            *judged += 1;
            if ok {
                *successes += 1;
            }
        }
    }

    acc.into_iter()
        .map(|(id, (mut stats, durations, successes, judged))| {
            if !durations.is_empty() {
                stats.average_duration_ms =
                    Some(durations.iter().sum::<u64>() / durations.len() as u64);
            }
            if judged > 0 {
                stats.success_rate = Some(successes as f64 / judged as f64);
            }
            (id, stats)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::timestamp;

    fn entry(workflow: &str, status: RunStatus, duration: Option<u64>) -> RunIndexEntry {
        RunIndexEntry {
            id: format!("{}-{:?}", workflow, duration),
            workflow_id: workflow.to_string(),
            workflow_name: workflow.to_uppercase(),
            status,
            started_at: duration.map(|_| timestamp::now()),
            completed_at: status.is_terminal().then(timestamp::now),
            duration_ms: duration,
            error: None,
        }
    }

    #[test]
    fn test_duration_sample_outcomes() {
        assert_eq!(
            duration_sample(&entry("a", RunStatus::Completed, Some(10))),
            Outcome::Valid(10)
        );
        assert_eq!(
            duration_sample(&entry("a", RunStatus::Running, Some(10))),
            Outcome::Skipped(SkipReason::NotFinished)
        );
        assert_eq!(
            duration_sample(&entry("a", RunStatus::Cancelled, None)),
            Outcome::Skipped(SkipReason::NeverStarted)
        );
    }

    #[test]
    fn test_success_sample_skips_cancelled() {
        assert_eq!(
            success_sample(&entry("a", RunStatus::Failed, Some(1))),
            Outcome::Valid(false)
        );
        assert_eq!(
            success_sample(&entry("a", RunStatus::Cancelled, Some(1))),
            Outcome::Skipped(SkipReason::Cancelled)
        );
    }

    #[test]
    fn test_summarize_per_workflow() {
        let entries = vec![
            entry("a", RunStatus::Completed, Some(100)),
            entry("a", RunStatus::Completed, Some(300)),
            entry("a", RunStatus::Failed, Some(200)),
            entry("a", RunStatus::Cancelled, None),
            entry("b", RunStatus::Running, Some(5)),
        ];

        let stats = summarize(&entries);
        assert_eq!(stats.len(), 2);

        let a = &stats["a"];
        assert_eq!(a.total, 4);
        assert_eq!(a.completed, 2);
        assert_eq!(a.failed, 1);
        assert_eq!(a.cancelled, 1);
        assert_eq!(a.average_duration_ms, Some(200));
        assert_eq!(a.skipped, 1);
        let rate = a.success_rate.unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(a.workflow_name, "A");

        let b = &stats["b"];
        assert_eq!(b.running, 1);
        assert_eq!(b.average_duration_ms, None);
        assert_eq!(b.success_rate, None);
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(SkipReason::NotFinished.to_string(), "run has not finished");
    }
}
