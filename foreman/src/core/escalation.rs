//! Bounded failure escalation: Retry -> Pivot -> Research -> Ask.
//!
//! Each failing task owns one [`FailureRecord`]. Levels only move forward
//! within a failure chain; only an external requeue starts over at Retry.

use serde::{Deserialize, Serialize};

use crate::core::types::{EscalationLevel, TaskId};
use crate::error::FailureKind;

/// Attempt limits per level (`retry_max`, `pivot_max`, `research_max`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationLimits {
    pub retry_max: u32,
    pub pivot_max: u32,
    pub research_max: u32,
}

impl Default for EscalationLimits {
    fn default() -> Self {
        Self {
            retry_max: 3,
            pivot_max: 3,
            research_max: 2,
        }
    }
}

impl EscalationLimits {
    fn max_for(&self, level: EscalationLevel) -> u32 {
        match level {
            EscalationLevel::Retry => self.retry_max,
            EscalationLevel::Pivot => self.pivot_max,
            EscalationLevel::Research => self.research_max,
            EscalationLevel::Ask => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub level: EscalationLevel,
    pub kind: FailureKind,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub level: EscalationLevel,
    pub retry_count: u32,
    pub pivot_count: u32,
    pub research_count: u32,
    /// Transient failures absorbed while on Pivot or Research.
    #[serde(default)]
    pub transient_count: u32,
    pub last_error: String,
    #[serde(default)]
    pub attempts: Vec<FailedAttempt>,
    /// Set when the task later succeeded on an escalated level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_via: Option<EscalationLevel>,
}

impl FailureRecord {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            level: EscalationLevel::Retry,
            retry_count: 0,
            pivot_count: 0,
            research_count: 0,
            transient_count: 0,
            last_error: String::new(),
            attempts: Vec::new(),
            resolved_via: None,
        }
    }

    /// Number of the next dispatch in this failure chain (1-indexed).
    pub fn next_attempt(&self) -> u32 {
        u32::try_from(self.attempts.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1)
    }
}

/// What the scheduler must do after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Dispatch the task again on `level`. `escalated` is true on level change.
    Redispatch {
        level: EscalationLevel,
        escalated: bool,
    },
    /// Ladder exhausted: mark Failed and surface a stuck report.
    Ask,
    /// Resource failure: mark Failed immediately without consuming budget.
    Abandon { reason: String },
}

/// What to do with the record after a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessDisposition {
    /// Success on Retry: drop the record.
    Clear,
    /// Success on Pivot or Research: counters reset, level remembered.
    Resolved(EscalationLevel),
}

/// Apply one failure to `record` and decide the next step.
pub fn record_failure(
    record: &mut FailureRecord,
    kind: FailureKind,
    error: &str,
    limits: &EscalationLimits,
) -> Decision {
    record.attempts.push(FailedAttempt {
        level: record.level,
        kind,
        error: error.to_string(),
    });
    record.last_error = error.to_string();
    record.resolved_via = None;

    if record.level == EscalationLevel::Ask {
        return Decision::Ask;
    }

    if kind == FailureKind::Resource {
        return Decision::Abandon {
            reason: format!("resource failure: {error}"),
        };
    }

    if kind == FailureKind::Transient && record.level != EscalationLevel::Retry {
        if record.transient_count < limits.retry_max {
            record.transient_count += 1;
            return Decision::Redispatch {
                level: record.level,
                escalated: false,
            };
        }
        // Transient budget exhausted on this level: count it like a logic failure.
    }

    let level = record.level;
    let count = match level {
        EscalationLevel::Retry => &mut record.retry_count,
        EscalationLevel::Pivot => &mut record.pivot_count,
        EscalationLevel::Research => &mut record.research_count,
        EscalationLevel::Ask => return Decision::Ask,
    };
    *count += 1;
    if *count < limits.max_for(level) {
        return Decision::Redispatch {
            level,
            escalated: false,
        };
    }
    *count = 0;
    escalate(record, limits)
}

/// Move to the next level that still has budget, or to Ask.
fn escalate(record: &mut FailureRecord, limits: &EscalationLimits) -> Decision {
    let mut next = next_level(record.level);
    while next != EscalationLevel::Ask && limits.max_for(next) == 0 {
        next = next_level(next);
    }
    record.level = next;
    record.transient_count = 0;
    match next {
        EscalationLevel::Ask => Decision::Ask,
        level => {
            match level {
                EscalationLevel::Pivot => record.pivot_count = 0,
                EscalationLevel::Research => record.research_count = 0,
                _ => {}
            }
            Decision::Redispatch {
                level,
                escalated: true,
            }
        }
    }
}

fn next_level(level: EscalationLevel) -> EscalationLevel {
    match level {
        EscalationLevel::Retry => EscalationLevel::Pivot,
        EscalationLevel::Pivot => EscalationLevel::Research,
        EscalationLevel::Research | EscalationLevel::Ask => EscalationLevel::Ask,
    }
}

/// Apply a success to the record.
pub fn record_success(record: &mut FailureRecord) -> SuccessDisposition {
    match record.level {
        EscalationLevel::Retry => SuccessDisposition::Clear,
        level => {
            record.retry_count = 0;
            record.pivot_count = 0;
            record.research_count = 0;
            record.transient_count = 0;
            record.resolved_via = Some(level);
            SuccessDisposition::Resolved(level)
        }
    }
}

/// Structured report produced when a task reaches Ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckReport {
    pub task_id: TaskId,
    pub description: String,
    pub attempts_summary: Vec<String>,
    pub last_error: String,
}

pub fn stuck_report(record: &FailureRecord, description: &str) -> StuckReport {
    let attempts_summary = record
        .attempts
        .iter()
        .enumerate()
        .map(|(idx, attempt)| {
            format!(
                "#{} {} ({}): {}",
                idx + 1,
                attempt.level,
                attempt.kind,
                attempt.error
            )
        })
        .collect();
    StuckReport {
        task_id: record.task_id,
        description: description.to_string(),
        attempts_summary,
        last_error: record.last_error.clone(),
    }
}
