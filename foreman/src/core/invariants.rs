//! Cross-structure invariants between tasks and slots.

use std::collections::BTreeSet;

use crate::core::state::OrchestrationState;
use crate::core::types::{SlotStatus, TaskStatus};

/// Check invariants the type system cannot express:
/// - Busy slot iff an assigned task is present
/// - No two Busy slots share an assigned task
/// - A task is Assigned iff exactly one Busy slot references it
/// - Assigned tasks have every dependency Done
/// - Busy slots never exceed the slot count
pub fn validate_invariants(state: &OrchestrationState) -> Vec<String> {
    let mut errors = Vec::new();
    let mut held = BTreeSet::new();

    for slot in state.slots.slots() {
        match (slot.status, slot.assigned_task) {
            (SlotStatus::Busy, None) => {
                errors.push(format!("slot {}: busy without an assigned task", slot.id));
            }
            (SlotStatus::Idle, Some(task)) => {
                errors.push(format!("slot {}: idle but holds task {task}", slot.id));
            }
            (SlotStatus::Busy, Some(task)) => {
                if !held.insert(task) {
                    errors.push(format!("task {task}: held by more than one busy slot"));
                }
                match state.tasks.get(&task) {
                    None => errors.push(format!("slot {}: holds unknown task {task}", slot.id)),
                    Some(found) if found.status != TaskStatus::Assigned => errors.push(format!(
                        "slot {}: holds task {task} which is {}",
                        slot.id,
                        found.status.as_str()
                    )),
                    Some(_) => {}
                }
            }
            (SlotStatus::Idle, None) => {}
        }
    }

    for task in state.tasks.values() {
        if task.status != TaskStatus::Assigned {
            continue;
        }
        if !held.contains(&task.id) {
            errors.push(format!("task {}: assigned but no busy slot holds it", task.id));
        }
        for dep in &task.depends_on {
            let done = state
                .tasks
                .get(dep)
                .is_some_and(|dep| dep.status == TaskStatus::Done);
            if !done {
                errors.push(format!(
                    "task {}: assigned before dependency {dep} is done",
                    task.id
                ));
            }
        }
    }

    errors
}
