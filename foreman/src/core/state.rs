//! The single orchestration record persisted after every mutation.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::budget::TokenBudget;
use crate::core::escalation::{FailureRecord, StuckReport};
use crate::core::graph::find_cycle;
use crate::core::overlap::TouchedFiles;
use crate::core::phase::{TransitionFacts, check_transition};
use crate::core::pool::SlotTable;
use crate::core::selector::UNREACHABLE_DEPENDENCY;
use crate::core::types::{Phase, Task, TaskId, TaskStatus};
use crate::error::{ConflictDetected, UnknownTask};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub event: String,
}

/// Integration progress, kept so an interrupted merge resumes where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeProgress {
    #[serde(default)]
    pub merged: Vec<TaskId>,
    /// Changed ranges of each merged task, relative to its merge base.
    #[serde(default)]
    pub touched: BTreeMap<TaskId, TouchedFiles>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictDetected>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub version: u32,
    /// Incremented on every resume from a checkpoint.
    pub session: u32,
    pub current_phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_phase: Option<Phase>,
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, Task>,
    pub slots: SlotTable,
    #[serde(default)]
    pub failures: BTreeMap<TaskId, FailureRecord>,
    pub token_budget: TokenBudget,
    #[serde(default)]
    pub merge: MergeProgress,
    #[serde(default)]
    pub verification_passed: bool,
    #[serde(default)]
    pub stuck_reports: Vec<StuckReport>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub checkpoint_lineage: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
}

impl OrchestrationState {
    pub fn new(slots: SlotTable, token_budget: TokenBudget) -> Self {
        Self {
            version: STATE_VERSION,
            session: 1,
            current_phase: Phase::Idle,
            resume_phase: None,
            tasks: BTreeMap::new(),
            slots,
            failures: BTreeMap::new(),
            token_budget,
            merge: MergeProgress::default(),
            verification_passed: false,
            stuck_reports: Vec::new(),
            history: Vec::new(),
            checkpoint_lineage: Vec::new(),
            target_branch: None,
        }
    }

    pub fn task(&self, id: TaskId) -> Result<&Task> {
        self.tasks.get(&id).ok_or_else(|| UnknownTask(id).into())
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or_else(|| UnknownTask(id).into())
    }

    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|task| task.status == status)
            .map(|task| task.id)
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|task| task.status.is_terminal())
    }

    pub fn transition_facts(&self) -> TransitionFacts {
        TransitionFacts {
            task_count: self.tasks.len(),
            graph_acyclic: find_cycle(&self.tasks).is_none(),
            all_tasks_terminal: self.all_terminal(),
            unresolved_conflicts: usize::from(self.merge.conflict.is_some()),
            verification_passed: self.verification_passed,
        }
    }

    /// Move to `to` if the phase machine allows it, recording history.
    pub fn transition(&mut self, to: Phase, at: DateTime<Utc>) -> Result<()> {
        let from = self.current_phase;
        check_transition(from, to, self.resume_phase, &self.transition_facts())?;
        if to == Phase::Checkpointed {
            self.resume_phase = Some(from);
        } else if from == Phase::Checkpointed {
            self.resume_phase = None;
        }
        self.current_phase = to;
        self.record(at, format!("phase {from} -> {to}"));
        Ok(())
    }

    pub fn record(&mut self, at: DateTime<Utc>, event: impl Into<String>) {
        self.history.push(HistoryEntry {
            at,
            event: event.into(),
        });
    }

    /// Re-open a Failed task at Retry level.
    ///
    /// Clears its failure record and stuck report, and re-opens any task that
    /// was skipped only because of it.
    pub fn requeue(&mut self, id: TaskId, at: DateTime<Utc>) -> Result<()> {
        match self.current_phase {
            Phase::Plan | Phase::Execute => {}
            Phase::Checkpointed if self.resume_phase == Some(Phase::Execute) => {}
            phase => {
                return Err(anyhow!(
                    "requeue is only possible before integration (phase is {phase})"
                ));
            }
        }
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Failed {
            return Err(anyhow!(
                "task {id} is {}, only failed tasks can be requeued",
                task.status.as_str()
            ));
        }
        task.status = TaskStatus::Pending;
        task.outcome_note = None;
        self.failures.remove(&id);
        self.stuck_reports.retain(|report| report.task_id != id);
        self.reopen_unblocked();
        self.record(at, format!("task {id} requeued"));
        Ok(())
    }

    /// Skipped-as-unreachable tasks whose dependencies are all alive again
    /// go back to Pending. Repeats to a fixpoint.
    fn reopen_unblocked(&mut self) {
        loop {
            let reopen: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|task| {
                    task.status == TaskStatus::Skipped
                        && task.outcome_note.as_deref() == Some(UNREACHABLE_DEPENDENCY)
                        && task.depends_on.iter().all(|dep| {
                            self.tasks.get(dep).is_some_and(|dep| {
                                !matches!(dep.status, TaskStatus::Failed | TaskStatus::Skipped)
                            })
                        })
                })
                .map(|task| task.id)
                .collect();
            if reopen.is_empty() {
                return;
            }
            for id in reopen {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.status = TaskStatus::Pending;
                    task.outcome_note = None;
                }
            }
        }
    }
}
