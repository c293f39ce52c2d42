//! End-to-end sessions against real git repositories.
//!
//! Workers are scripted, but workspaces are real worktrees and integration
//! runs real merges, so these cover plan -> execute -> integrate -> review
//! the way `foreman run` drives it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use foreman::core::events::Event;
use foreman::core::types::{Phase, TaskId, TaskStatus};
use foreman::io::journal::Journal;
use foreman::io::workspace::GitWorktreeBackend;
use foreman::merger::IntegrateOutcome;
use foreman::pool;
use foreman::runtime::{Collaborators, Runtime};
use foreman::session::{self, SessionOutcome};
use foreman::test_support::{ScriptedWorker, Step, TestRepo};

fn open(root: &Path, worker: &Arc<ScriptedWorker>) -> Runtime {
    let worker = Arc::clone(worker);
    Runtime::open(root, move |paths, _config| {
        Collaborators::with_parts(
            paths,
            worker,
            Arc::new(GitWorktreeBackend::new(paths.root())),
        )
    })
    .expect("open runtime")
}

/// Write `json` outside the repository so the root stays clean.
fn graph_file(dir: &tempfile::TempDir, json: &str) -> PathBuf {
    let path = dir.path().join("graph.json");
    fs::write(&path, json).expect("write graph");
    path
}

fn planned(repo: &TestRepo, graph: &str, worker: &Arc<ScriptedWorker>) -> (Runtime, tempfile::TempDir) {
    pool::init(repo.path(), Some(3)).expect("init");
    let dir = tempfile::tempdir().expect("graph dir");
    let mut rt = open(repo.path(), worker);
    session::plan(&mut rt, &graph_file(&dir, graph)).expect("plan");
    (rt, dir)
}

#[test]
fn disjoint_tasks_run_integrate_and_verify() {
    let repo = TestRepo::new();
    let worker = Arc::new(
        ScriptedWorker::new()
            .script(1, [Step::write_file("a.txt", "alpha\n")])
            .script(2, [Step::write_file("b.txt", "beta\n")])
            .script(3, [Step::write_file("c.txt", "gamma\n")]),
    );
    let (mut rt, _dir) = planned(
        &repo,
        r#"{"tasks": [
            {"id": 1, "description": "write a", "files": ["a.txt"], "verification_command": "test -f a.txt"},
            {"id": 2, "description": "write b", "files": ["b.txt"]},
            {"id": 3, "description": "write c", "depends_on": [1], "verification_command": "grep -q alpha a.txt && test -f c.txt"}
        ]}"#,
        &worker,
    );

    let outcome = session::run(&mut rt, None, false).expect("run");
    assert_eq!(outcome, SessionOutcome::Complete);
    assert_eq!(rt.state.current_phase, Phase::Complete);
    assert!(rt.state.verification_passed);
    assert_eq!(rt.state.merge.merged, vec![TaskId(1), TaskId(2), TaskId(3)]);
    for file in ["a.txt", "b.txt", "c.txt"] {
        assert!(repo.path().join(file).exists(), "{file} not integrated");
    }
    assert_eq!(repo.git().current_branch().expect("branch"), "main");
    assert!(rt.state.slots.slots().iter().all(|slot| slot.assigned_task.is_none()));

    let merged_events = Journal::new(&rt.paths.events_path)
        .read_all()
        .expect("journal")
        .into_iter()
        .filter(|entry| matches!(entry.event, Event::BranchMerged { .. }))
        .count();
    assert_eq!(merged_events, 3);
}

#[test]
fn same_region_conflict_waits_for_resolution() {
    let repo = TestRepo::new();
    repo.commit_file("shared.txt", "one\ntwo\nthree\n", "shared");
    let worker = Arc::new(
        ScriptedWorker::new()
            .script(1, [Step::write_file("shared.txt", "one\nTWO\nthree\n")])
            .script(2, [Step::write_file("shared.txt", "one\n2\nthree\n")]),
    );
    let (mut rt, _dir) = planned(
        &repo,
        r#"{"tasks": [
            {"id": 1, "description": "shout"},
            {"id": 2, "description": "digits"}
        ]}"#,
        &worker,
    );

    let outcome = session::run(&mut rt, None, false).expect("run");
    let SessionOutcome::Conflict(conflict) = outcome else {
        panic!("expected conflict, got {outcome:?}");
    };
    assert_eq!(conflict.task_id, TaskId(2));
    assert_eq!(conflict.files, vec!["shared.txt".to_string()]);
    assert_eq!(rt.state.current_phase, Phase::Integrate);

    // Still halted on a second attempt without a resolution.
    let again = session::run(&mut rt, None, false).expect("rerun");
    assert!(matches!(again, SessionOutcome::Conflict(_)));

    repo.run_git(&["merge", "-q", "-X", "theirs", "--no-edit", "foreman/task-2"]);
    let merged = session::merge(&mut rt, None, true).expect("merge --resolved");
    assert_eq!(merged, IntegrateOutcome::Integrated { merged: Vec::new() });
    assert_eq!(rt.state.current_phase, Phase::Review);

    assert_eq!(session::run(&mut rt, None, false).expect("finish"), SessionOutcome::Complete);
    assert_eq!(
        fs::read_to_string(repo.path().join("shared.txt")).expect("read"),
        "one\n2\nthree\n"
    );
}

#[test]
fn failing_verification_stays_in_review() {
    let repo = TestRepo::new();
    let worker = Arc::new(ScriptedWorker::new().script(1, [Step::write_file("a.txt", "a\n")]));
    let (mut rt, _dir) = planned(
        &repo,
        r#"{"tasks": [{"id": 1, "description": "write a", "verification_command": "test -f missing.txt"}]}"#,
        &worker,
    );

    let outcome = session::run(&mut rt, None, false).expect("run");
    let SessionOutcome::VerificationFailed(report) = outcome else {
        panic!("expected verification failure, got {outcome:?}");
    };
    assert_eq!(report.checks.len(), 1);
    assert!(!report.checks[0].passed);
    assert_eq!(rt.state.current_phase, Phase::Review);
    assert!(rt.paths.logs_dir.join("verify/task-1.log").exists());
}

#[test]
fn accepted_failures_integrate_the_rest() {
    let repo = TestRepo::new();
    let worker = Arc::new(
        ScriptedWorker::new()
            .script(1, [Step::write_file("a.txt", "a\n")])
            .script(2, (0..9).map(|_| Step::reject("still broken"))),
    );
    let (mut rt, _dir) = planned(
        &repo,
        r#"{"tasks": [
            {"id": 1, "description": "write a"},
            {"id": 2, "description": "hopeless"},
            {"id": 3, "description": "after hopeless", "depends_on": [2]}
        ]}"#,
        &worker,
    );

    let outcome = session::run(&mut rt, None, false).expect("run");
    assert!(matches!(outcome, SessionOutcome::Stuck { ref reports } if reports.len() == 1));
    assert_eq!(rt.state.task(TaskId(3)).expect("task").status, TaskStatus::Skipped);

    let outcome = session::run(&mut rt, None, true).expect("accept failed");
    assert_eq!(outcome, SessionOutcome::Complete);
    assert_eq!(rt.state.merge.merged, vec![TaskId(1)]);
    assert!(repo.path().join("a.txt").exists());
}

/// Independent tasks finishing in opposite orders integrate to the same tree.
#[test]
fn merge_result_does_not_depend_on_completion_order() {
    let graph = r#"{"tasks": [
        {"id": 1, "description": "one"},
        {"id": 2, "description": "two"},
        {"id": 3, "description": "three"}
    ]}"#;
    let slow = Duration::from_millis(300);
    let run_with = |delays: [Duration; 3]| -> String {
        let repo = TestRepo::new();
        let worker = Arc::new(
            ScriptedWorker::new()
                .script(1, [Step::write_file("one.txt", "1\n").after(delays[0])])
                .script(2, [Step::write_file("two.txt", "2\n").after(delays[1])])
                .script(3, [Step::write_file("three.txt", "3\n").after(delays[2])]),
        );
        let (mut rt, _dir) = planned(&repo, graph, &worker);
        assert_eq!(session::run(&mut rt, None, false).expect("run"), SessionOutcome::Complete);
        repo.git().head_tree().expect("tree")
    };

    let forward = run_with([Duration::ZERO, slow, slow * 2]);
    let backward = run_with([slow * 2, slow, Duration::ZERO]);
    assert_eq!(forward, backward);
}
