//! Integration of Done task branches into the target branch.
//!
//! Branches merge in topological order of the whole graph (lowest id first
//! among peers), so the result does not depend on completion order. Each
//! branch is classified against what this integration already merged:
//! disjoint files merge directly, shared files with separate line ranges get
//! a git merge attempt, and overlapping ranges halt integration with a
//! conflict for the resolver.

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::events::Event;
use crate::core::graph::topological_order;
use crate::core::overlap::{MergeClass, TouchedFiles, absorb, classify, parse_zero_context_diff};
use crate::core::types::{Phase, TaskId, TaskStatus, task_branch};
use crate::error::ConflictDetected;
use crate::io::git::{Git, MergeAttempt};
use crate::io::strategies::Resolution;
use crate::runtime::Runtime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrateOutcome {
    /// Every Done branch is merged.
    Integrated { merged: Vec<TaskId> },
    /// Halted on a conflict awaiting `merge --resolved`.
    Conflict(ConflictDetected),
}

/// Merge every unmerged Done branch into the target, resuming after the
/// last merged task.
#[instrument(skip_all)]
pub fn integrate(rt: &mut Runtime, git: &Git) -> Result<IntegrateOutcome> {
    if rt.state.current_phase != Phase::Integrate {
        return Err(anyhow!(
            "merging only happens in {} (phase is {})",
            Phase::Integrate,
            rt.state.current_phase
        ));
    }
    if let Some(conflict) = rt.state.merge.conflict.clone() {
        return Ok(IntegrateOutcome::Conflict(conflict));
    }
    let target = target_branch(rt)?;
    if git.merge_in_progress()? {
        warn!("aborting merge left over from an interrupted integration");
        git.merge_abort()?;
    }
    git.ensure_clean()?;
    git.checkout_branch(&target)?;

    let mut merged_now = Vec::new();
    for task_id in merge_order(rt)? {
        let branch = task_branch(task_id);
        if git.branch_head(&branch)?.is_none() {
            return Err(anyhow!("task {task_id} is done but branch {branch} is missing"));
        }
        let base = git.merge_base(&target, &branch)?;
        let incoming = parse_zero_context_diff(&git.diff_zero_context(&base, &branch)?);
        let already = merged_ranges(rt, git, &branch)?;
        let class = classify(&already, &incoming);
        debug!(task_id = %task_id, class = ?class, "classified branch");

        let conflict_files = match class {
            MergeClass::Overlapping { files } => Some(files),
            MergeClass::Disjoint | MergeClass::NonOverlapping { .. } => {
                let message = format!("foreman: merge task {task_id}");
                match git.merge_no_ff(&branch, &message)? {
                    MergeAttempt::Merged => None,
                    MergeAttempt::Conflicted(files) => {
                        git.merge_abort()?;
                        Some(files)
                    }
                }
            }
        };

        rt.state.merge.touched.insert(task_id, incoming);
        match conflict_files {
            None => {
                mark_merged(rt, task_id, &branch)?;
                merged_now.push(task_id);
            }
            Some(files) => {
                let conflict = ConflictDetected {
                    task_id,
                    branch,
                    files,
                };
                if !halt(rt, git, conflict.clone())? {
                    return Ok(IntegrateOutcome::Conflict(conflict));
                }
                merged_now.push(task_id);
            }
        }
    }
    info!(merged = merged_now.len(), "integration finished");
    Ok(IntegrateOutcome::Integrated { merged: merged_now })
}

/// Accept an external resolution of the halted conflict.
///
/// The conflicting branch must already be merged into the target.
pub fn mark_resolved(rt: &mut Runtime, git: &Git) -> Result<TaskId> {
    let conflict = rt
        .state
        .merge
        .conflict
        .clone()
        .ok_or_else(|| anyhow!("no merge conflict is pending"))?;
    let target = target_branch(rt)?;
    if !git.is_ancestor(&conflict.branch, &target)? {
        return Err(anyhow!(
            "{} is not merged into {target} yet; merge it and resolve the conflict first",
            conflict.branch
        ));
    }
    rt.state.merge.conflict = None;
    mark_merged(rt, conflict.task_id, &conflict.branch)?;
    info!(task_id = %conflict.task_id, "conflict resolved");
    Ok(conflict.task_id)
}

/// Done tasks not merged yet, in integration order.
pub fn merge_order(rt: &Runtime) -> Result<Vec<TaskId>> {
    Ok(topological_order(&rt.state.tasks)?
        .into_iter()
        .filter(|id| {
            rt.state
                .tasks
                .get(id)
                .is_some_and(|task| task.status == TaskStatus::Done)
        })
        .filter(|id| !rt.state.merge.merged.contains(id))
        .collect())
}

fn target_branch(rt: &Runtime) -> Result<String> {
    rt.state
        .target_branch
        .clone()
        .ok_or_else(|| anyhow!("no target branch recorded (run `foreman plan` first)"))
}

/// Ranges changed by merged tasks that `branch` does not already contain.
fn merged_ranges(rt: &Runtime, git: &Git, branch: &str) -> Result<TouchedFiles> {
    let mut touched = TouchedFiles::new();
    for task_id in &rt.state.merge.merged {
        if git.is_ancestor(&task_branch(*task_id), branch)? {
            continue;
        }
        if let Some(ranges) = rt.state.merge.touched.get(task_id) {
            absorb(&mut touched, ranges);
        }
    }
    Ok(touched)
}

fn mark_merged(rt: &mut Runtime, task_id: TaskId, branch: &str) -> Result<()> {
    let at = rt.now();
    rt.state.merge.merged.push(task_id);
    rt.state.record(at, format!("merged {branch}"));
    rt.persist()?;
    rt.emit(Event::BranchMerged {
        task_id,
        branch: branch.to_string(),
    })
}

/// Persist the conflict and ask the resolver. Returns true if integration
/// may continue.
fn halt(rt: &mut Runtime, git: &Git, conflict: ConflictDetected) -> Result<bool> {
    warn!(task_id = %conflict.task_id, files = ?conflict.files, "integration conflict");
    let at = rt.now();
    rt.state.merge.conflict = Some(conflict.clone());
    rt.state.record(at, conflict.to_string());
    rt.persist()?;
    rt.emit(Event::ConflictDetected {
        task_id: conflict.task_id,
        files: conflict.files.clone(),
    })?;
    match rt.collab.resolver.resolve(&conflict)? {
        Resolution::Resolved => {
            mark_resolved(rt, git)?;
            Ok(true)
        }
        Resolution::Deferred => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::io::config::ForemanConfig;
    use crate::test_support::{FakeBackend, ScriptedWorker, TestRepo, fake_runtime, graph};

    fn integrating(repo: &TestRepo, edges: &[(u32, &[u32])]) -> Runtime {
        let mut rt = fake_runtime(
            repo.path(),
            ForemanConfig::default(),
            graph(edges),
            Arc::new(ScriptedWorker::new()),
            Arc::new(FakeBackend::default()),
        );
        for task in rt.state.tasks.values_mut() {
            task.status = TaskStatus::Done;
        }
        rt.state.current_phase = Phase::Integrate;
        rt
    }

    #[test]
    fn disjoint_branches_merge_without_conflict() {
        let repo = TestRepo::new();
        repo.branch_with_file("foreman/task-1", "a.txt", "a\n");
        repo.branch_with_file("foreman/task-2", "b.txt", "b\n");
        let mut rt = integrating(&repo, &[(1, &[]), (2, &[])]);

        let outcome = integrate(&mut rt, &repo.git()).expect("integrate");
        assert_eq!(
            outcome,
            IntegrateOutcome::Integrated {
                merged: vec![TaskId(1), TaskId(2)]
            }
        );
        assert!(repo.path().join("a.txt").exists());
        assert!(repo.path().join("b.txt").exists());
        assert!(rt.state.merge.conflict.is_none());
    }

    #[test]
    fn same_region_halts_with_conflict_until_resolved() {
        let repo = TestRepo::new();
        repo.commit_file("shared.txt", "one\ntwo\nthree\n", "shared");
        repo.branch_with_file("foreman/task-1", "shared.txt", "one\nTWO\nthree\n");
        repo.branch_with_file("foreman/task-2", "shared.txt", "one\n2\nthree\n");
        let mut rt = integrating(&repo, &[(1, &[]), (2, &[])]);

        let outcome = integrate(&mut rt, &repo.git()).expect("integrate");
        let IntegrateOutcome::Conflict(conflict) = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(conflict.task_id, TaskId(2));
        assert_eq!(conflict.files, vec!["shared.txt".to_string()]);
        assert_eq!(rt.state.merge.merged, vec![TaskId(1)]);
        assert!(!repo.git().merge_in_progress().expect("merge state"));

        let err = mark_resolved(&mut rt, &repo.git()).unwrap_err();
        assert!(err.to_string().contains("not merged"));
        assert!(matches!(
            integrate(&mut rt, &repo.git()).expect("still halted"),
            IntegrateOutcome::Conflict(_)
        ));
    }

    #[test]
    fn non_ascii_file_names_are_compared_by_range() {
        let repo = TestRepo::new();
        repo.commit_file("café.txt", "one\ntwo\nthree\n", "accents");
        repo.branch_with_file("foreman/task-1", "café.txt", "one\nTWO\nthree\n");
        repo.branch_with_file("foreman/task-2", "café.txt", "one\n2\nthree\n");
        let mut rt = integrating(&repo, &[(1, &[]), (2, &[])]);

        let outcome = integrate(&mut rt, &repo.git()).expect("integrate");
        let IntegrateOutcome::Conflict(conflict) = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(conflict.files, vec!["café.txt".to_string()]);
        assert!(rt.state.merge.touched[&TaskId(1)].contains_key("café.txt"));
    }

    #[test]
    fn separate_ranges_in_one_file_merge_structurally() {
        let repo = TestRepo::new();
        let base: String = (1..=20).map(|n| format!("line {n}\n")).collect();
        repo.commit_file("long.txt", &base, "long file");
        repo.branch_with_file(
            "foreman/task-1",
            "long.txt",
            &base.replace("line 2\n", "line two\n"),
        );
        repo.branch_with_file(
            "foreman/task-2",
            "long.txt",
            &base.replace("line 18\n", "line eighteen\n"),
        );
        let mut rt = integrating(&repo, &[(1, &[]), (2, &[])]);

        let outcome = integrate(&mut rt, &repo.git()).expect("integrate");
        assert!(matches!(outcome, IntegrateOutcome::Integrated { .. }));
        let merged = std::fs::read_to_string(repo.path().join("long.txt")).expect("read");
        assert!(merged.contains("line two\n"));
        assert!(merged.contains("line eighteen\n"));
    }

    #[test]
    fn resolved_conflict_lets_integration_continue() {
        let repo = TestRepo::new();
        repo.commit_file("shared.txt", "one\ntwo\nthree\n", "shared");
        repo.branch_with_file("foreman/task-1", "shared.txt", "one\nTWO\nthree\n");
        repo.branch_with_file("foreman/task-2", "shared.txt", "one\n2\nthree\n");
        repo.branch_with_file("foreman/task-3", "other.txt", "3\n");
        let mut rt = integrating(&repo, &[(1, &[]), (2, &[]), (3, &[])]);
        let git = repo.git();
        assert!(matches!(
            integrate(&mut rt, &git).expect("integrate"),
            IntegrateOutcome::Conflict(_)
        ));

        repo.run_git(&["merge", "-q", "-X", "theirs", "--no-edit", "foreman/task-2"]);
        assert_eq!(mark_resolved(&mut rt, &git).expect("resolve"), TaskId(2));
        let outcome = integrate(&mut rt, &git).expect("continue");
        assert_eq!(
            outcome,
            IntegrateOutcome::Integrated {
                merged: vec![TaskId(3)]
            }
        );
        assert_eq!(rt.state.merge.merged, vec![TaskId(1), TaskId(2), TaskId(3)]);
        assert!(rt.state.merge.conflict.is_none());
    }

    #[test]
    fn integrate_outside_integrate_phase_is_refused() {
        let repo = TestRepo::new();
        let mut rt = integrating(&repo, &[(1, &[])]);
        rt.state.current_phase = Phase::Execute;
        let err = integrate(&mut rt, &repo.git()).unwrap_err();
        assert!(err.to_string().contains("INTEGRATE"));
    }

    #[test]
    fn merge_order_follows_the_graph_not_completion() {
        let repo = TestRepo::new();
        let rt = integrating(&repo, &[(3, &[]), (1, &[3]), (2, &[])]);
        assert_eq!(
            merge_order(&rt).expect("order"),
            vec![TaskId(2), TaskId(3), TaskId(1)]
        );
    }
}
