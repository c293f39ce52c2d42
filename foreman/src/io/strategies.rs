//! Pluggable collaborators consulted by escalation and integration.
//!
//! Defaults are deterministic and local: Pivot hints are derived from the
//! failure history, Research context from the task's files, conflicts are
//! deferred to the operator, and learnings go to a JSONL file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::journal::append_json_line;
use crate::core::escalation::FailureRecord;
use crate::core::types::{EscalationLevel, Task, TaskId};
use crate::error::ConflictDetected;

/// Produces a fresh approach for a Pivot re-dispatch.
pub trait AlternativeFinder: Send + Sync {
    fn alternative(&self, task: &Task, record: &FailureRecord) -> Result<String>;
}

/// Produces extra context for a Research re-dispatch.
pub trait ContextGatherer: Send + Sync {
    fn gather(&self, task: &Task, record: &FailureRecord) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The conflict was fixed on the target; integration continues.
    Resolved,
    /// Leave integration halted until `merge --resolved`.
    Deferred,
}

pub trait ConflictResolver {
    fn resolve(&self, conflict: &ConflictDetected) -> Result<Resolution>;
}

/// Sink for findings from tasks that only succeeded after Research.
pub trait LearningStore: Send {
    fn record(&mut self, learning: &Learning) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learning {
    pub at: DateTime<Utc>,
    pub task_id: TaskId,
    pub description: String,
    pub resolved_via: EscalationLevel,
    pub failed_attempts: Vec<String>,
    pub evidence: String,
}

/// Hints built from what already failed, so each pivot asks for something new.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailureHistoryHints;

impl AlternativeFinder for FailureHistoryHints {
    fn alternative(&self, task: &Task, record: &FailureRecord) -> Result<String> {
        let mut hint = format!(
            "Earlier attempts at task {} did not work. Take a different approach \
             than any of these:\n",
            task.id
        );
        for attempt in &record.attempts {
            hint.push_str(&format!("- ({}) {}\n", attempt.level, attempt.error));
        }
        if !task.files.is_empty() {
            hint.push_str(&format!(
                "Consider whether the change belongs outside {} or needs a smaller first step.\n",
                task.files.join(", ")
            ));
        }
        Ok(hint.trim_end().to_string())
    }
}

/// Gathers excerpts of the task's files from the project root.
#[derive(Debug, Clone)]
pub struct FileContextGatherer {
    root: PathBuf,
    max_bytes_per_file: usize,
}

impl FileContextGatherer {
    pub fn new(root: impl Into<PathBuf>, max_bytes_per_file: usize) -> Self {
        Self {
            root: root.into(),
            max_bytes_per_file,
        }
    }

    fn excerpt(&self, relative: &str) -> String {
        let path = self.root.join(relative);
        match fs::read_to_string(&path) {
            Ok(contents) if contents.len() > self.max_bytes_per_file => {
                let mut cut = self.max_bytes_per_file;
                while !contents.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}\n[... {} more bytes]", &contents[..cut], contents.len() - cut)
            }
            Ok(contents) => contents,
            Err(err) => {
                debug!(path = %path.display(), err = %err, "file not readable for context");
                format!("[not readable: {err}]")
            }
        }
    }
}

impl ContextGatherer for FileContextGatherer {
    fn gather(&self, task: &Task, record: &FailureRecord) -> Result<String> {
        let mut context = String::new();
        context.push_str("Failure history:\n");
        for (idx, attempt) in record.attempts.iter().enumerate() {
            context.push_str(&format!(
                "{}. {} ({}): {}\n",
                idx + 1,
                attempt.level,
                attempt.kind,
                attempt.error
            ));
        }
        for file in &task.files {
            context.push_str(&format!("\n--- {file} ---\n"));
            context.push_str(&self.excerpt(file));
            context.push('\n');
        }
        Ok(context.trim_end().to_string())
    }
}

/// Always defers: a person resolves the conflict and runs `merge --resolved`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferToOperator;

impl ConflictResolver for DeferToOperator {
    fn resolve(&self, _conflict: &ConflictDetected) -> Result<Resolution> {
        Ok(Resolution::Deferred)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLearningStore;

impl LearningStore for NoopLearningStore {
    fn record(&mut self, _learning: &Learning) -> Result<()> {
        Ok(())
    }
}

/// Appends learnings to `.foreman/learnings.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlLearningStore {
    path: PathBuf,
}

impl JsonlLearningStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LearningStore for JsonlLearningStore {
    fn record(&mut self, learning: &Learning) -> Result<()> {
        append_json_line(&self.path, learning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::escalation::{EscalationLimits, record_failure};
    use crate::error::FailureKind;

    fn failed_record() -> FailureRecord {
        let mut record = FailureRecord::new(TaskId(1));
        let limits = EscalationLimits::default();
        record_failure(&mut record, FailureKind::Logic, "test_a failed", &limits);
        record_failure(&mut record, FailureKind::Transient, "network reset", &limits);
        record
    }

    #[test]
    fn hints_list_every_failed_approach() {
        let mut task = Task::new(1, "fix");
        task.files = vec!["src/a.rs".to_string()];
        let hint = FailureHistoryHints
            .alternative(&task, &failed_record())
            .expect("hint");
        assert!(hint.contains("- (retry) test_a failed"));
        assert!(hint.contains("- (retry) network reset"));
        assert!(hint.contains("src/a.rs"));
    }

    #[test]
    fn gatherer_includes_file_excerpts_and_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.rs"), "0123456789").expect("write");
        let mut task = Task::new(1, "fix");
        task.files = vec!["a.rs".to_string(), "gone.rs".to_string()];
        let context = FileContextGatherer::new(temp.path(), 4)
            .gather(&task, &failed_record())
            .expect("gather");
        assert!(context.contains("1. retry (logic): test_a failed"));
        assert!(context.contains("--- a.rs ---\n0123\n[... 6 more bytes]"));
        assert!(context.contains("--- gone.rs ---\n[not readable"));
    }

    #[test]
    fn jsonl_store_appends_one_line_per_learning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = JsonlLearningStore::new(temp.path().join("learnings.jsonl"));
        let learning = Learning {
            at: Utc::now(),
            task_id: TaskId(2),
            description: "flaky".to_string(),
            resolved_via: EscalationLevel::Research,
            failed_attempts: vec!["#1 retry (logic): boom".to_string()],
            evidence: "green".to_string(),
        };
        store.record(&learning).expect("record");
        store.record(&learning).expect("record");
        let contents = fs::read_to_string(store.path()).expect("read");
        assert_eq!(contents.lines().count(), 2);
        let parsed: Learning =
            serde_json::from_str(contents.lines().next().expect("line")).expect("parse");
        assert_eq!(parsed, learning);
    }
}
