//! Orchestration events published by the coordinator.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{EscalationLevel, Phase, SlotId, TaskId};
use crate::error::FailureKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PhaseChanged {
        from: Phase,
        to: Phase,
    },
    TaskAssigned {
        task_id: TaskId,
        slot_id: SlotId,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<EscalationLevel>,
    },
    TaskDone {
        task_id: TaskId,
        evidence: String,
    },
    TaskFailed {
        task_id: TaskId,
        kind: FailureKind,
        error: String,
    },
    TaskEscalated {
        task_id: TaskId,
        level: EscalationLevel,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
    TaskStuck {
        task_id: TaskId,
        last_error: String,
    },
    SlotReleased {
        slot_id: SlotId,
        task_id: TaskId,
    },
    CompressionHint {
        used: u64,
        max: u64,
    },
    HandoffRequested {
        used: u64,
        max: u64,
    },
    CheckpointCreated {
        checkpoint_id: String,
        reason: String,
    },
    BranchMerged {
        task_id: TaskId,
        branch: String,
    },
    ConflictDetected {
        task_id: TaskId,
        files: Vec<String>,
    },
    VerificationFinished {
        passed: bool,
    },
}

impl Event {
    /// One-line form used for history entries and logs.
    pub fn summary(&self) -> String {
        match self {
            Event::PhaseChanged { from, to } => format!("phase {from} -> {to}"),
            Event::TaskAssigned {
                task_id,
                slot_id,
                attempt,
                level,
            } => match level {
                Some(level) => {
                    format!("task {task_id} assigned to slot {slot_id} (attempt {attempt}, {level})")
                }
                None => format!("task {task_id} assigned to slot {slot_id} (attempt {attempt})"),
            },
            Event::TaskDone { task_id, .. } => format!("task {task_id} done"),
            Event::TaskFailed {
                task_id,
                kind,
                error,
            } => format!("task {task_id} failed ({kind}): {error}"),
            Event::TaskEscalated { task_id, level } => {
                format!("task {task_id} escalated to {level}")
            }
            Event::TaskSkipped { task_id, reason } => format!("task {task_id} skipped: {reason}"),
            Event::TaskStuck { task_id, .. } => format!("task {task_id} stuck"),
            Event::SlotReleased { slot_id, task_id } => {
                format!("slot {slot_id} released by task {task_id}")
            }
            Event::CompressionHint { used, max } => format!("token usage {used}/{max}: compress"),
            Event::HandoffRequested { used, max } => {
                format!("token usage {used}/{max}: handoff requested")
            }
            Event::CheckpointCreated {
                checkpoint_id,
                reason,
            } => format!("checkpoint {checkpoint_id} ({reason})"),
            Event::BranchMerged { task_id, branch } => format!("merged {branch} (task {task_id})"),
            Event::ConflictDetected { task_id, files } => {
                format!("conflict on task {task_id}: {}", files.join(", "))
            }
            Event::VerificationFinished { passed } => {
                format!("verification {}", if *passed { "passed" } else { "failed" })
            }
        }
    }
}

/// Receiver of published events.
pub trait EventSink {
    fn publish(&mut self, at: DateTime<Utc>, event: &Event) -> Result<()>;
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<Event>,
}

impl EventSink for MemorySink {
    fn publish(&mut self, _at: DateTime<Utc>, event: &Event) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }
}

/// Fans one event out to several sinks.
#[derive(Default)]
pub struct EventBus {
    sinks: Vec<Box<dyn EventSink + Send>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl EventSink + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn publish(&mut self, at: DateTime<Utc>, event: &Event) -> Result<()> {
        for sink in &mut self.sinks {
            sink.publish(at, event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let event = Event::TaskAssigned {
            task_id: TaskId(3),
            slot_id: SlotId(1),
            attempt: 1,
            level: None,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "task_assigned");
        assert_eq!(json["task_id"], 3);
        assert!(json.get("level").is_none());
    }

    #[test]
    fn summaries_are_single_line() {
        let event = Event::ConflictDetected {
            task_id: TaskId(2),
            files: vec!["a.rs".into(), "b.rs".into()],
        };
        assert_eq!(event.summary(), "conflict on task 2: a.rs, b.rs");
        assert_eq!(
            Event::PhaseChanged {
                from: Phase::Plan,
                to: Phase::Execute
            }
            .summary(),
            "phase PLAN -> EXECUTE"
        );
    }
}
