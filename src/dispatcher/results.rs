//! Per-revision result files.
//!
//! One `key=value` line per field, written to `<dir>/<revision>.txt` on
//! every RESULT. The three timestamp rows are always present (empty when
//! unknown); runner identity and latencies appear only when known. A repeat
//! RESULT for the same revision overwrites the previous file.

use crate::dispatcher::protocol::RunnerKey;
use crate::dispatcher::state::Timeline;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::Path;

/// Writes (or overwrites) the result file for one revision.
pub fn write_result_file(
    dir: &Path,
    revision: &str,
    status: &str,
    seconds: &str,
    timeline: &Timeline,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create results dir {}", dir.display()))?;

    let mut lines = vec![
        format!("commit={}", revision),
        format!("status={}", status),
        format!("duration_seconds_runner={}", seconds),
        format!("queued_at_local={}", stamp(timeline.queued_at)),
        format!("assigned_at_local={}", stamp(timeline.assigned_at)),
        format!("completed_at_local={}", stamp(timeline.completed_at)),
    ];
    if let Some(RunnerKey { host, port }) = &timeline.runner {
        lines.push(format!("runner_host={}", host));
        lines.push(format!("runner_port={}", port));
    }
    if let (Some(queued), Some(assigned)) = (timeline.queued_at, timeline.assigned_at) {
        lines.push(format!(
            "latency_queue_to_assign_sec={}",
            latency(queued, assigned)
        ));
    }
    if let (Some(assigned), Some(completed)) = (timeline.assigned_at, timeline.completed_at) {
        lines.push(format!(
            "latency_assign_to_finish_sec={}",
            latency(assigned, completed)
        ));
    }
    if let (Some(queued), Some(completed)) = (timeline.queued_at, timeline.completed_at) {
        lines.push(format!("latency_total_sec={}", latency(queued, completed)));
    }

    let path = dir.join(format!("{}.txt", revision));
    std::fs::write(&path, lines.join("\n") + "\n")
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn stamp(at: Option<DateTime<Local>>) -> String {
    at.map(|at| at.to_rfc3339()).unwrap_or_default()
}

fn latency(from: DateTime<Local>, to: DateTime<Local>) -> String {
    let seconds = (to - from).num_milliseconds() as f64 / 1000.0;
    format!("{:.3}", seconds)
}
