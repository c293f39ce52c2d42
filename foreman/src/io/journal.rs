//! Event sinks: JSONL journal and tracing.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::events::{Event, EventSink};

/// Append one compact JSON value plus newline to `path`.
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value).context("serialize journal line")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// One line of `.foreman/events.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

/// Appends every event to the journal file.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read all entries back, skipping nothing.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", self.path.display(), idx + 1))
            })
            .collect()
    }
}

impl EventSink for Journal {
    fn publish(&mut self, at: DateTime<Utc>, event: &Event) -> Result<()> {
        append_json_line(
            &self.path,
            &JournalEntry {
                at,
                event: event.clone(),
            },
        )
    }
}

/// Mirrors events into `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&mut self, _at: DateTime<Utc>, event: &Event) -> Result<()> {
        info!(event = %event.summary(), "orchestration event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskId;

    #[test]
    fn journal_appends_flattened_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".foreman").join("events.jsonl");
        let mut journal = Journal::new(&path);
        let at = Utc::now();
        journal
            .publish(
                at,
                &Event::TaskDone {
                    task_id: TaskId(1),
                    evidence: "ok".to_string(),
                },
            )
            .expect("publish");
        journal
            .publish(
                at,
                &Event::TaskSkipped {
                    task_id: TaskId(2),
                    reason: "unreachable dependency".to_string(),
                },
            )
            .expect("publish");

        let raw = fs::read_to_string(&path).expect("read");
        let first = raw.lines().next().expect("line");
        assert!(first.contains("\"event\":\"task_done\""));
        assert!(first.contains("\"task_id\":1"));

        let entries = journal.read_all().expect("read all");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].at, at);
    }
}
