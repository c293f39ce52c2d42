//! Deterministic dispatch decisions for the scheduler.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::core::graph::dependents_count;
use crate::core::pool::SlotTable;
use crate::core::types::{Task, TaskId, TaskStatus};

pub const UNREACHABLE_DEPENDENCY: &str = "unreachable dependency";

/// Pending tasks whose dependencies are all Done, ordered for dispatch:
/// most direct dependents first, then lowest id.
pub fn ready_set(tasks: &BTreeMap<TaskId, Task>) -> Vec<TaskId> {
    let counts = dependents_count(tasks);
    let mut ready: Vec<TaskId> = tasks
        .values()
        .filter(|task| task.status == TaskStatus::Pending)
        .filter(|task| {
            task.depends_on.iter().all(|dep| {
                tasks
                    .get(dep)
                    .is_some_and(|dep| dep.status == TaskStatus::Done)
            })
        })
        .map(|task| task.id)
        .collect();
    ready.sort_by_key(|id| (Reverse(counts.get(id).copied().unwrap_or(0)), *id));
    ready
}

/// How many more tasks may start right now.
pub fn dispatch_capacity(slots: &SlotTable, max_agents: u32) -> usize {
    let limit = usize::try_from(max_agents).unwrap_or(usize::MAX);
    slots.idle_count().min(limit.saturating_sub(slots.busy_count()))
}

/// Tasks to dispatch in this loop iteration, in order.
pub fn next_dispatch(
    tasks: &BTreeMap<TaskId, Task>,
    slots: &SlotTable,
    max_agents: u32,
) -> Vec<TaskId> {
    let capacity = dispatch_capacity(slots, max_agents);
    ready_set(tasks).into_iter().take(capacity).collect()
}

/// Mark Pending tasks with a Failed or Skipped dependency as Skipped, to a
/// fixpoint. Returns the newly skipped ids in the order they were skipped.
pub fn skip_unreachable(tasks: &mut BTreeMap<TaskId, Task>) -> Vec<TaskId> {
    let mut skipped = Vec::new();
    loop {
        let blocked: Vec<TaskId> = tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                task.depends_on.iter().any(|dep| {
                    tasks.get(dep).is_some_and(|dep| {
                        matches!(dep.status, TaskStatus::Failed | TaskStatus::Skipped)
                    })
                })
            })
            .map(|task| task.id)
            .collect();
        if blocked.is_empty() {
            return skipped;
        }
        for id in blocked {
            if let Some(task) = tasks.get_mut(&id) {
                task.status = TaskStatus::Skipped;
                task.outcome_note = Some(UNREACHABLE_DEPENDENCY.to_string());
                skipped.push(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::core::graph::{GraphSpec, TaskSpec, build_tasks};

    fn tasks(items: &[(u32, &[u32])]) -> BTreeMap<TaskId, Task> {
        build_tasks(&GraphSpec {
            tasks: items
                .iter()
                .map(|(id, deps)| TaskSpec {
                    id: *id,
                    description: format!("task {id}"),
                    files: Vec::new(),
                    depends_on: deps.to_vec(),
                    verification_command: None,
                })
                .collect(),
        })
        .expect("graph")
    }

    #[test]
    fn ready_set_orders_by_dependents_then_id() {
        let tasks = tasks(&[(1, &[]), (2, &[]), (3, &[2]), (4, &[2]), (5, &[1]), (6, &[])]);
        assert_eq!(ready_set(&tasks), vec![TaskId(2), TaskId(1), TaskId(6)]);
    }

    #[test]
    fn ready_set_requires_done_dependencies() {
        let mut tasks = tasks(&[(1, &[]), (2, &[1])]);
        tasks.get_mut(&TaskId(1)).expect("t1").status = TaskStatus::Assigned;
        assert!(ready_set(&tasks).is_empty());
        tasks.get_mut(&TaskId(1)).expect("t1").status = TaskStatus::Done;
        assert_eq!(ready_set(&tasks), vec![TaskId(2)]);
    }

    #[test]
    fn dispatch_is_bounded_by_max_agents_and_idle_slots() {
        let tasks = tasks(&[(1, &[]), (2, &[]), (3, &[]), (4, &[]), (5, &[])]);
        let mut slots = SlotTable::init(5, Path::new("/ws"));
        assert_eq!(next_dispatch(&tasks, &slots, 3).len(), 3);

        slots.acquire(TaskId(1)).expect("acquire");
        slots.acquire(TaskId(2)).expect("acquire");
        assert_eq!(dispatch_capacity(&slots, 3), 1);

        let small = SlotTable::init(2, Path::new("/ws"));
        assert_eq!(next_dispatch(&tasks, &small, 8).len(), 2);
    }

    #[test]
    fn failed_dependency_skips_the_whole_downstream_chain() {
        let mut tasks = tasks(&[(1, &[]), (2, &[1]), (3, &[2]), (4, &[])]);
        tasks.get_mut(&TaskId(1)).expect("t1").status = TaskStatus::Failed;
        let skipped = skip_unreachable(&mut tasks);
        assert_eq!(skipped, vec![TaskId(2), TaskId(3)]);
        assert_eq!(tasks[&TaskId(3)].outcome_note.as_deref(), Some(UNREACHABLE_DEPENDENCY));
        assert_eq!(tasks[&TaskId(4)].status, TaskStatus::Pending);
    }
}
