//! JSONL journal of dispatcher decisions.
//!
//! One JSON object per line with a monotonic sequence number, appended to
//! `<results>/events.jsonl`. The journal is write-only from the dispatcher's
//! point of view; it exists so a queue/assign/evict history can be
//! reconstructed after the fact.

use chrono::Local;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Name of the journal file inside the results directory.
pub const JOURNAL_FILE: &str = "events.jsonl";

/// A scheduling decision worth keeping.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CiEvent<'a> {
    RunnerRegistered { runner: String },
    RunnerEvicted { runner: String, reason: &'a str },
    RevisionQueued { commit: &'a str, retry: u32 },
    RevisionAssigned { commit: &'a str, runner: String },
    RevisionCompleted { commit: &'a str, status: &'a str },
    RevisionDropped { commit: &'a str, retries: u32, reason: &'a str },
}

/// A single journal line.
#[derive(Serialize)]
struct JournalLine {
    /// Monotonic sequence number, unique for the process lifetime.
    seq: u64,
    /// Local timestamp, RFC 3339.
    ts: String,
    /// The event payload, tagged by `kind`.
    event: Value,
}

/// Append-only JSONL event journal.
pub struct EventJournal {
    seq: AtomicU64,
    file: Mutex<File>,
}

impl EventJournal {
    /// Opens (or creates) the journal inside `results_dir`.
    pub fn open(results_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(results_dir)
            .with_context(|| format!("failed to create {}", results_dir.display()))?;
        let path = results_dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            seq: AtomicU64::new(0),
            file: Mutex::new(file),
        })
    }

    /// Appends one event. Thread-safe; write failures are swallowed.
    pub fn record(&self, event: CiEvent<'_>) {
        let line = JournalLine {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            ts: Local::now().to_rfc3339(),
            event: serde_json::to_value(&event).unwrap_or(Value::Null),
        };
        if let Ok(mut file) = self.file.lock() {
            if let Ok(json) = serde_json::to_string(&line) {
                let _ = writeln!(file, "{}", json);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_appended_with_increasing_seq() {
        let dir = tempfile::TempDir::new().unwrap();
        let journal = EventJournal::open(dir.path()).unwrap();

        journal.record(CiEvent::RunnerRegistered {
            runner: "127.0.0.1:9001".to_string(),
        });
        journal.record(CiEvent::RevisionQueued {
            commit: "abc123",
            retry: 0,
        });

        let content = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["seq"], 1);
        assert_eq!(lines[1]["seq"], 2);
        assert_eq!(lines[0]["event"]["kind"], "runner_registered");
        assert_eq!(lines[1]["event"]["kind"], "revision_queued");
        assert_eq!(lines[1]["event"]["commit"], "abc123");
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let journal = EventJournal::open(dir.path()).unwrap();
            journal.record(CiEvent::RevisionCompleted {
                commit: "c1",
                status: "OK",
            });
        }
        {
            let journal = EventJournal::open(dir.path()).unwrap();
            journal.record(CiEvent::RevisionCompleted {
                commit: "c2",
                status: "FAIL",
            });
        }

        let content = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
