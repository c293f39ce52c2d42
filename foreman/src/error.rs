//! Typed errors for conditions callers branch on.
//!
//! Orchestration code returns `anyhow::Result`; these types travel inside the
//! `anyhow::Error` and are recovered with `downcast_ref` where a caller needs
//! to pick an exit code or a recovery path.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{SlotId, TaskId};

/// Failure taxonomy used to route worker failures through escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// I/O or network hiccup; retried without strategy changes.
    Transient,
    /// Verification or test failure; escalates through Pivot and Research.
    Logic,
    /// Missing slot or tool; fatal to the task, consumes no budget.
    Resource,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Logic => "logic",
            FailureKind::Resource => "resource",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no idle workspace slot available for task {task_id}")]
pub struct NoSlotAvailable {
    pub task_id: TaskId,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown workspace slot {0}")]
pub struct UnknownSlot(pub SlotId);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown task {0}")]
pub struct UnknownTask(pub TaskId);

/// One recorded branch whose current state differs from the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchMismatch {
    pub slot_id: SlotId,
    pub branch: String,
    pub expected_head: Option<String>,
    pub actual_head: Option<String>,
}

impl fmt::Display for BranchMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {} branch {} expected {} found {}",
            self.slot_id,
            self.branch,
            self.expected_head.as_deref().unwrap_or("<none>"),
            self.actual_head.as_deref().unwrap_or("<missing>")
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("checkpoint {checkpoint_id} is inconsistent with the repository: {}", render_mismatches(.mismatches))]
pub struct CheckpointInconsistent {
    pub checkpoint_id: String,
    pub mismatches: Vec<BranchMismatch>,
}

fn render_mismatches(mismatches: &[BranchMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("merge conflict integrating task {task_id} ({branch}): {}", .files.join(", "))]
pub struct ConflictDetected {
    pub task_id: TaskId,
    pub branch: String,
    pub files: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("task graph contains a dependency cycle through tasks {}", render_ids(.cycle))]
pub struct CyclicDependency {
    pub cycle: Vec<TaskId>,
}

fn render_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid task graph:\n- {}", .problems.join("\n- "))]
pub struct InvalidGraph {
    pub problems: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid phase transition {from} -> {to}: {reason}")]
pub struct InvalidTransition {
    pub from: String,
    pub to: String,
    pub reason: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("worker timed out after {after_secs}s")]
pub struct WorkerTimedOut {
    pub after_secs: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("worker cancelled")]
pub struct WorkerCancelled;

/// The slot's workspace could not be provisioned for a task.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("workspace for slot {slot_id} unavailable: {reason}")]
pub struct WorkspaceUnavailable {
    pub slot_id: SlotId,
    pub reason: String,
}

/// The worker command is missing or not executable.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("worker command `{program}` cannot be started: {reason}")]
pub struct WorkerUnavailable {
    pub program: String,
    pub reason: String,
}

/// Short machine-readable label for the CLI's structured error line.
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    if err.downcast_ref::<NoSlotAvailable>().is_some()
        || err.downcast_ref::<WorkspaceUnavailable>().is_some()
        || err.downcast_ref::<WorkerUnavailable>().is_some()
    {
        "resource"
    } else if err.downcast_ref::<CheckpointInconsistent>().is_some() {
        "consistency"
    } else if err.downcast_ref::<ConflictDetected>().is_some() {
        "conflict"
    } else if err.downcast_ref::<CyclicDependency>().is_some()
        || err.downcast_ref::<InvalidGraph>().is_some()
    {
        "graph"
    } else if err.downcast_ref::<InvalidTransition>().is_some() {
        "phase"
    } else if err.downcast_ref::<UnknownSlot>().is_some()
        || err.downcast_ref::<UnknownTask>().is_some()
    {
        "lookup"
    } else {
        "internal"
    }
}
