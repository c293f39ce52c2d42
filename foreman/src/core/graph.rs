//! Task graph validation and ordering.
//!
//! The graph arrives from an external decomposer as an ordered list of task
//! specs. Everything here is pure: ids, dependency closure, cycle detection,
//! dependents counts and a deterministic topological order.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::types::{Task, TaskId, TaskStatus};
use crate::error::{CyclicDependency, InvalidGraph};

/// Serialized task graph (`{"tasks": [...]}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub tasks: Vec<TaskSpec>,
}

/// One task as produced by the decomposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: u32,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_command: Option<String>,
}

/// Validate a graph spec and materialize Pending tasks keyed by id.
///
/// Rejects empty graphs, duplicate ids, unknown or self dependencies, and
/// cycles. Cycles surface as [`CyclicDependency`], everything else as
/// [`InvalidGraph`].
pub fn build_tasks(spec: &GraphSpec) -> Result<BTreeMap<TaskId, Task>> {
    let mut problems = Vec::new();
    if spec.tasks.is_empty() {
        problems.push("graph has no tasks".to_string());
    }

    let mut tasks = BTreeMap::new();
    for item in &spec.tasks {
        let id = TaskId(item.id);
        if tasks.contains_key(&id) {
            problems.push(format!("duplicate task id {id}"));
            continue;
        }
        if item.description.trim().is_empty() {
            problems.push(format!("task {id}: description must not be empty"));
        }
        let depends_on: BTreeSet<TaskId> = item.depends_on.iter().copied().map(TaskId).collect();
        tasks.insert(
            id,
            Task {
                id,
                description: item.description.clone(),
                files: item.files.clone(),
                depends_on,
                verification_command: item.verification_command.clone(),
                status: TaskStatus::Pending,
                phase_group: 0,
                outcome_note: None,
            },
        );
    }

    for task in tasks.values() {
        for dep in &task.depends_on {
            if *dep == task.id {
                problems.push(format!("task {} depends on itself", task.id));
            } else if !tasks.contains_key(dep) {
                problems.push(format!("task {} depends on unknown task {dep}", task.id));
            }
        }
    }

    if !problems.is_empty() {
        return Err(InvalidGraph { problems }.into());
    }

    if let Some(cycle) = find_cycle(&tasks) {
        return Err(CyclicDependency { cycle }.into());
    }

    let order = topological_order(&tasks)?;
    for id in order {
        let group = tasks
            .get(&id)
            .map(|task| {
                task.depends_on
                    .iter()
                    .filter_map(|dep| tasks.get(dep))
                    .map(|dep| dep.phase_group + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        if let Some(task) = tasks.get_mut(&id) {
            task.phase_group = group;
        }
    }

    Ok(tasks)
}

/// Return one dependency cycle (first id repeated at the end), if any.
pub fn find_cycle(tasks: &BTreeMap<TaskId, Task>) -> Option<Vec<TaskId>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Visited,
    }

    fn visit(
        id: TaskId,
        tasks: &BTreeMap<TaskId, Task>,
        marks: &mut BTreeMap<TaskId, Mark>,
        stack: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        match marks.get(&id) {
            Some(Mark::Visited) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|candidate| *candidate == id)?;
                let mut cycle = stack[start..].to_vec();
                cycle.push(id);
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(task) = tasks.get(&id) {
            for dep in &task.depends_on {
                if let Some(cycle) = visit(*dep, tasks, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Visited);
        None
    }

    let mut marks = BTreeMap::new();
    for id in tasks.keys() {
        let mut stack = Vec::new();
        if let Some(cycle) = visit(*id, tasks, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Kahn's algorithm with lowest-id-first tie-break.
///
/// The order depends only on the graph, never on task status or completion
/// order, which keeps integration deterministic.
pub fn topological_order(tasks: &BTreeMap<TaskId, Task>) -> Result<Vec<TaskId>> {
    let mut remaining: BTreeMap<TaskId, usize> = tasks
        .values()
        .map(|task| {
            let known = task
                .depends_on
                .iter()
                .filter(|dep| tasks.contains_key(dep))
                .count();
            (task.id, known)
        })
        .collect();
    let dependents = dependents_index(tasks);

    let mut ready: BTreeSet<TaskId> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        for child in dependents.get(&id).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(child) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(*child);
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let cycle = find_cycle(tasks).unwrap_or_default();
        return Err(CyclicDependency { cycle }.into());
    }
    Ok(order)
}

/// Map each task to the tasks that directly depend on it.
pub fn dependents_index(tasks: &BTreeMap<TaskId, Task>) -> BTreeMap<TaskId, BTreeSet<TaskId>> {
    let mut index: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
    for task in tasks.values() {
        for dep in &task.depends_on {
            index.entry(*dep).or_default().insert(task.id);
        }
    }
    index
}

/// Number of direct dependents per task (0 for leaves).
pub fn dependents_count(tasks: &BTreeMap<TaskId, Task>) -> BTreeMap<TaskId, usize> {
    let index = dependents_index(tasks);
    tasks
        .keys()
        .map(|id| (*id, index.get(id).map_or(0, BTreeSet::len)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(items: &[(u32, &[u32])]) -> GraphSpec {
        GraphSpec {
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
        }
    }

    #[test]
    fn builds_pending_tasks_with_phase_groups() {
        let tasks = build_tasks(&spec(&[(1, &[]), (2, &[1]), (3, &[1, 2]), (4, &[])]))
            .expect("valid graph");
        let groups: Vec<(u32, u32)> = tasks
            .values()
            .map(|task| (task.id.0, task.phase_group))
            .collect();
        assert_eq!(groups, vec![(1, 0), (2, 1), (3, 2), (4, 0)]);
        assert!(
            tasks
                .values()
                .all(|task| task.status == TaskStatus::Pending)
        );
    }

    #[test]
    fn rejects_cycles_with_typed_error() {
        let err = build_tasks(&spec(&[(1, &[3]), (2, &[1]), (3, &[2])])).unwrap_err();
        let cycle = err
            .downcast_ref::<CyclicDependency>()
            .expect("cyclic dependency error");
        assert_eq!(cycle.cycle.first(), cycle.cycle.last());
        assert_eq!(cycle.cycle.len(), 4);
    }

    #[test]
    fn reports_all_structural_problems() {
        let mut graph = spec(&[(1, &[1]), (2, &[9]), (2, &[])]);
        graph.tasks[0].description = "  ".to_string();
        let err = build_tasks(&graph).unwrap_err();
        let invalid = err.downcast_ref::<InvalidGraph>().expect("invalid graph");
        let joined = invalid.problems.join("\n");
        assert!(joined.contains("duplicate task id 2"));
        assert!(joined.contains("task 1 depends on itself"));
        assert!(joined.contains("task 2 depends on unknown task 9"));
        assert!(joined.contains("description must not be empty"));
    }

    #[test]
    fn rejects_empty_graph() {
        let err = build_tasks(&GraphSpec { tasks: Vec::new() }).unwrap_err();
        assert!(err.to_string().contains("graph has no tasks"));
    }

    #[test]
    fn topological_order_prefers_lowest_ready_id() {
        let tasks = build_tasks(&spec(&[(5, &[]), (3, &[5]), (1, &[]), (2, &[1])]))
            .expect("valid graph");
        let order = topological_order(&tasks).expect("order");
        assert_eq!(order, vec![TaskId(1), TaskId(2), TaskId(5), TaskId(3)]);
    }

    #[test]
    fn counts_direct_dependents() {
        let tasks =
            build_tasks(&spec(&[(1, &[]), (2, &[1]), (3, &[1]), (4, &[2])])).expect("valid graph");
        let counts = dependents_count(&tasks);
        assert_eq!(counts[&TaskId(1)], 2);
        assert_eq!(counts[&TaskId(2)], 1);
        assert_eq!(counts[&TaskId(3)], 0);
    }
}
