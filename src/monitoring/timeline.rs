//! Execution Timeline
//!
//! Step timings of a run record, rendered as an ASCII Gantt chart for
//! `runhub show --timeline`.

use chrono::{DateTime, Utc};

use crate::run::{timestamp, RunRecord, RunStatus};

/// Width of the chart area in characters.
const CHART_WIDTH: f64 = 50.0;

/// One step's span relative to the run start.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub step_id: String,
    pub status: RunStatus,
    /// Milliseconds from run start to step start
    pub offset_ms: u64,
    pub duration_ms: u64,
}

/// Step spans of one run, in start order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTimeline {
    entries: Vec<TimelineEntry>,
    total_ms: u64,
}

impl ExecutionTimeline {
    /// Builds the timeline of steps that started.
    ///
    /// Unfinished steps extend to the run's end, or to `now` while it runs.
    pub fn from_record(record: &RunRecord) -> Self {
        let Some(run_start) = record.started_at else {
            return Self::default();
        };
        let run_end = record.completed_at.unwrap_or_else(timestamp::now);

        let mut entries: Vec<TimelineEntry> = record
            .steps
            .iter()
            .filter_map(|step| {
                let started = step.started_at?;
                let ended = step.completed_at.unwrap_or(run_end);
                Some(TimelineEntry {
                    step_id: step.step_id.clone(),
                    status: step.status,
                    offset_ms: span_ms(&run_start, &started),
                    duration_ms: step
                        .duration_ms
                        .unwrap_or_else(|| span_ms(&started, &ended)),
                })
            })
            .collect();
        entries.sort_by_key(|e| e.offset_ms);

        let total_ms = entries
            .iter()
            .map(|e| e.offset_ms + e.duration_ms)
            .max()
            .unwrap_or(0)
            .max(span_ms(&run_start, &run_end));

        Self { entries, total_ms }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        if self.entries.is_empty() {
            output.push_str("  (no steps started)\n");
            return output;
        }

        let scale = if self.total_ms == 0 {
            0.0
        } else {
            CHART_WIDTH / self.total_ms as f64
        };

        for entry in &self.entries {
            let start_pos = (entry.offset_ms as f64 * scale) as usize;
            let width = (entry.duration_ms as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&bar_char(entry.status).to_string().repeat(width));

            output.push_str(&format!(
                "{:12} |{:<50}| {} ms {}\n",
                truncate(&entry.step_id, 12),
                bar,
                entry.duration_ms,
                entry.status
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", self.total_ms));
        output
    }
}

fn span_ms(from: &DateTime<Utc>, to: &DateTime<Utc>) -> u64 {
    timestamp::millis_between(from, to)
}

fn bar_char(status: RunStatus) -> char {
    match status {
        RunStatus::Failed => 'x',
        RunStatus::Cancelled => '-',
        _ => '#',
    }
}

/// Pads or truncates a string to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::StepEvent;
    use chrono::Duration;
    use serde_json::json;

    fn finished_record() -> RunRecord {
        let t0 = timestamp::parse("2024-03-01T10:00:00.000000Z").unwrap();
        let mut record = RunRecord::new("r1", "wf", "WF", ["fetch", "transform", "load"], json!({}));
        record.mark_running(t0);

        let mut start = StepEvent::start("fetch");
        start.timestamp = t0;
        record.apply_step_event(&start);
        let mut done = StepEvent::complete("fetch", 100);
        done.timestamp = t0 + Duration::milliseconds(100);
        record.apply_step_event(&done);

        let mut start = StepEvent::start("transform");
        start.timestamp = t0 + Duration::milliseconds(100);
        record.apply_step_event(&start);
        let mut failed = StepEvent::error("transform", 300, "bad row");
        failed.timestamp = t0 + Duration::milliseconds(400);
        record.apply_step_event(&failed);

        record.finish_failed("bad row", t0 + Duration::milliseconds(400));
        record
    }

    #[test]
    fn test_from_record_offsets() {
        let timeline = ExecutionTimeline::from_record(&finished_record());
        let entries = timeline.entries();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].step_id, "fetch");
        assert_eq!(entries[0].offset_ms, 0);
        assert_eq!(entries[0].duration_ms, 100);
        assert_eq!(entries[1].step_id, "transform");
        assert_eq!(entries[1].offset_ms, 100);
        assert_eq!(entries[1].status, RunStatus::Failed);
        assert_eq!(timeline.total_ms(), 400);
    }

    #[test]
    fn test_gantt_chart_rendering() {
        let chart = ExecutionTimeline::from_record(&finished_record()).gantt_chart();
        assert!(chart.contains("Execution Timeline"));
        assert!(chart.contains("fetch"));
        assert!(chart.contains("xxx"));
        assert!(!chart.contains("load"));
        assert!(chart.contains("Total: 400 ms"));
    }

    #[test]
    fn test_unstarted_run_is_empty() {
        let record = RunRecord::new("r2", "wf", "WF", ["a"], json!({}));
        let timeline = ExecutionTimeline::from_record(&record);
        assert!(timeline.is_empty());
        assert!(timeline.gantt_chart().contains("no steps started"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a_very_long_step_name", 12), "a_very_lo...");
    }
}
