//! End-of-session summary printed by `foreman run` and `foreman status`.

use std::fmt;

use serde::Serialize;

use crate::core::escalation::StuckReport;
use crate::core::state::OrchestrationState;
use crate::core::types::{Phase, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLine {
    pub task_id: TaskId,
    pub description: String,
    /// Evidence for Done tasks, the reason for Skipped and Failed ones.
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalReport {
    pub phase: Phase,
    pub session: u32,
    pub done: Vec<ReportLine>,
    pub skipped: Vec<ReportLine>,
    pub failed: Vec<ReportLine>,
    pub pending: Vec<TaskId>,
    pub stuck: Vec<StuckReport>,
    pub merged: Vec<TaskId>,
    pub tokens_used: u64,
    pub tokens_max: u64,
    pub tokens_ratio: f64,
}

impl FinalReport {
    pub fn from_state(state: &OrchestrationState) -> Self {
        let lines = |status: TaskStatus, fallback: &str| -> Vec<ReportLine> {
            state
                .tasks
                .values()
                .filter(|task| task.status == status)
                .map(|task| ReportLine {
                    task_id: task.id,
                    description: task.description.clone(),
                    note: task
                        .outcome_note
                        .clone()
                        .unwrap_or_else(|| fallback.to_string()),
                })
                .collect()
        };
        let pending = state
            .tasks
            .values()
            .filter(|task| !task.status.is_terminal())
            .map(|task| task.id)
            .collect();
        Self {
            phase: state.current_phase,
            session: state.session,
            done: lines(TaskStatus::Done, "no evidence recorded"),
            skipped: lines(TaskStatus::Skipped, "no reason recorded"),
            failed: lines(TaskStatus::Failed, "no reason recorded"),
            pending,
            stuck: state.stuck_reports.clone(),
            merged: state.merge.merged.clone(),
            tokens_used: state.token_budget.used,
            tokens_max: state.token_budget.max,
            tokens_ratio: state.token_budget.ratio(),
        }
    }
}

impl fmt::Display for FinalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "phase {} (session {}), tokens {}/{} ({:.0}%)",
            self.phase,
            self.session,
            self.tokens_used,
            self.tokens_max,
            self.tokens_ratio * 100.0
        )?;
        section(f, "done", &self.done)?;
        section(f, "skipped", &self.skipped)?;
        section(f, "failed", &self.failed)?;
        if !self.pending.is_empty() {
            let ids: Vec<String> = self.pending.iter().map(ToString::to_string).collect();
            writeln!(f, "not finished: {}", ids.join(", "))?;
        }
        if !self.merged.is_empty() {
            writeln!(f, "merged: {} branch(es)", self.merged.len())?;
        }
        for report in &self.stuck {
            writeln!(f, "stuck task {}: {}", report.task_id, report.description)?;
            for attempt in &report.attempts_summary {
                writeln!(f, "    {attempt}")?;
            }
            writeln!(f, "    last error: {}", report.last_error)?;
        }
        Ok(())
    }
}

fn section(f: &mut fmt::Formatter<'_>, title: &str, lines: &[ReportLine]) -> fmt::Result {
    if lines.is_empty() {
        return Ok(());
    }
    writeln!(f, "{title} ({}):", lines.len())?;
    for line in lines {
        writeln!(f, "  {} {}: {}", line.task_id, line.description, line.note)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::core::budget::TokenBudget;
    use crate::core::pool::SlotTable;
    use crate::core::selector::UNREACHABLE_DEPENDENCY;
    use crate::test_support::graph;

    #[test]
    fn report_lists_every_outcome_with_its_note() {
        let mut state = OrchestrationState::new(
            SlotTable::init(1, Path::new("/ws")),
            TokenBudget::new(1_000, 0.7, 0.8),
        );
        state.tasks = graph(&[(1, &[]), (2, &[]), (3, &[2]), (4, &[])]);
        let mut set = |id: u32, status: TaskStatus, note: &str| {
            let task = state.tasks.get_mut(&TaskId(id)).expect("task");
            task.status = status;
            task.outcome_note = Some(note.to_string());
        };
        set(1, TaskStatus::Done, "tests pass");
        set(2, TaskStatus::Failed, "stuck after 9 attempts: boom");
        set(3, TaskStatus::Skipped, UNREACHABLE_DEPENDENCY);
        state.stuck_reports.push(StuckReport {
            task_id: TaskId(2),
            description: "task 2".to_string(),
            attempts_summary: vec!["#1 retry (logic): boom".to_string()],
            last_error: "boom".to_string(),
        });

        let report = FinalReport::from_state(&state);
        assert_eq!(report.pending, vec![TaskId(4)]);
        let text = report.to_string();
        assert!(text.contains("done (1):\n  1 task 1: tests pass\n"));
        assert!(text.contains("failed (1):\n  2 task 2: stuck after 9 attempts: boom\n"));
        assert!(text.contains("skipped (1):\n  3 task 3: unreachable dependency\n"));
        assert!(text.contains("not finished: 4\n"));
        assert!(text.contains("stuck task 2: task 2\n    #1 retry (logic): boom\n    last error: boom\n"));
    }
}
