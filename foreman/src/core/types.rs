//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between core components. They do not
//! depend on external state or I/O and serialize to stable JSON.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Numeric task identifier; ordering is the scheduler's tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workspace slot identifier (index into the fixed pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Done,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Done, Failed and Skipped end scheduling for a task.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// A unit of work from the task graph plus its scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub files: Vec<String>,
    pub depends_on: BTreeSet<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_command: Option<String>,
    pub status: TaskStatus,
    /// Depth in the DAG: 0 for roots, otherwise 1 + the deepest dependency.
    pub phase_group: u32,
    /// Evidence (done), skip reason (skipped) or failure reason (failed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_note: Option<String>,
}

impl Task {
    pub fn new(id: u32, description: impl Into<String>) -> Self {
        Self {
            id: TaskId(id),
            description: description.into(),
            files: Vec::new(),
            depends_on: BTreeSet::new(),
            verification_command: None,
            status: TaskStatus::Pending,
            phase_group: 0,
            outcome_note: None,
        }
    }

    /// Deterministic branch name; retries of the same task reuse it.
    pub fn branch_name(&self) -> String {
        task_branch(self.id)
    }
}

pub fn task_branch(id: TaskId) -> String {
    format!("foreman/task-{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Idle,
    Busy,
}

/// One isolated execution context in the fixed pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub status: SlotStatus,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_task: Option<TaskId>,
    /// Last task this slot hosted, used to keep retries on the same slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task: Option<TaskId>,
}

/// Read-only view returned by the pool's `status` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub id: SlotId,
    pub status: SlotStatus,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub assigned_task: Option<TaskId>,
}

impl From<&Slot> for SlotInfo {
    fn from(slot: &Slot) -> Self {
        Self {
            id: slot.id,
            status: slot.status,
            path: slot.path.clone(),
            branch: slot.branch.clone(),
            assigned_task: slot.assigned_task,
        }
    }
}

/// Which strategy tier a failing task is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationLevel {
    Retry,
    Pivot,
    Research,
    Ask,
}

impl EscalationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationLevel::Retry => "retry",
            EscalationLevel::Pivot => "pivot",
            EscalationLevel::Research => "research",
            EscalationLevel::Ask => "ask",
        }
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra guidance handed to the worker on an escalated re-dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptContext {
    pub level: Option<EscalationLevel>,
    /// 1-indexed dispatch count for the task in this failure chain.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Terminal result emitted by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerOutcome {
    Approved {
        evidence: String,
        #[serde(default)]
        tokens_used: u64,
    },
    Rejected {
        reason: String,
        #[serde(default = "default_rejection_kind")]
        kind: FailureKind,
        #[serde(default)]
        tokens_used: u64,
    },
}

fn default_rejection_kind() -> FailureKind {
    FailureKind::Logic
}

impl WorkerOutcome {
    pub fn tokens_used(&self) -> u64 {
        match self {
            WorkerOutcome::Approved { tokens_used, .. }
            | WorkerOutcome::Rejected { tokens_used, .. } => *tokens_used,
        }
    }
}

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Idle,
    Plan,
    Execute,
    Integrate,
    Review,
    Complete,
    Checkpointed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Plan => "PLAN",
            Phase::Execute => "EXECUTE",
            Phase::Integrate => "INTEGRATE",
            Phase::Review => "REVIEW",
            Phase::Complete => "COMPLETE",
            Phase::Checkpointed => "CHECKPOINTED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
