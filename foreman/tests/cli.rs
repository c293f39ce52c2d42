//! CLI tests: spawn the `foreman` binary against a scratch repository and
//! check exit codes and the `error: kind=...` line on stderr.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use foreman::exit_codes;
use foreman::test_support::TestRepo;

fn foreman(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_foreman"))
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .expect("spawn foreman")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn graph_file(dir: &tempfile::TempDir, json: &str) -> PathBuf {
    let path = dir.path().join("graph.json");
    fs::write(&path, json).expect("write graph");
    path
}

fn init_and_plan(repo: &TestRepo, slots: &str, dir: &tempfile::TempDir, json: &str) {
    let init = foreman(repo.path(), &["init", slots]);
    assert!(init.status.success(), "init: {}", stderr(&init));
    let graph = graph_file(dir, json);
    let plan = foreman(repo.path(), &["plan", graph.to_str().expect("utf-8 path")]);
    assert!(plan.status.success(), "plan: {}", stderr(&plan));
}

const TWO_TASKS: &str = r#"{"tasks": [
    {"id": 1, "description": "first"},
    {"id": 2, "description": "second"}
]}"#;

#[test]
fn acquire_beyond_pool_size_exits_with_no_slot_code() {
    let repo = TestRepo::new();
    let dir = tempfile::tempdir().expect("tempdir");
    init_and_plan(&repo, "1", &dir, TWO_TASKS);

    let first = foreman(repo.path(), &["acquire", "1"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK), "{}", stderr(&first));
    assert!(repo.path().join(".foreman/workspaces/slot-0").exists());

    let second = foreman(repo.path(), &["acquire", "2"]);
    assert_eq!(second.status.code(), Some(exit_codes::NO_SLOT));
    assert!(stderr(&second).contains("error: kind=resource"), "{}", stderr(&second));

    let released = foreman(repo.path(), &["release", "0"]);
    assert!(released.status.success(), "{}", stderr(&released));
    let retry = foreman(repo.path(), &["acquire", "2"]);
    assert_eq!(retry.status.code(), Some(exit_codes::OK), "{}", stderr(&retry));
}

#[test]
fn cyclic_graph_is_rejected_with_graph_kind() {
    let repo = TestRepo::new();
    let init = foreman(repo.path(), &["init", "2"]);
    assert!(init.status.success(), "{}", stderr(&init));
    let dir = tempfile::tempdir().expect("tempdir");
    let graph = graph_file(
        &dir,
        r#"{"tasks": [
            {"id": 1, "description": "a", "depends_on": [2]},
            {"id": 2, "description": "b", "depends_on": [1]}
        ]}"#,
    );

    let plan = foreman(repo.path(), &["plan", graph.to_str().expect("utf-8 path")]);
    assert_eq!(plan.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&plan).contains("kind=graph"), "{}", stderr(&plan));
}

#[test]
fn commands_before_init_fail() {
    let repo = TestRepo::new();
    let status = foreman(repo.path(), &["status"]);
    assert_eq!(status.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&status).contains("not initialized"), "{}", stderr(&status));
}

#[test]
fn resume_refuses_a_branch_that_moved_since_the_checkpoint() {
    let repo = TestRepo::new();
    let dir = tempfile::tempdir().expect("tempdir");
    init_and_plan(&repo, "1", &dir, TWO_TASKS);

    let acquire = foreman(repo.path(), &["acquire", "1"]);
    assert!(acquire.status.success(), "{}", stderr(&acquire));
    let checkpoint = foreman(repo.path(), &["checkpoint"]);
    assert!(checkpoint.status.success(), "{}", stderr(&checkpoint));
    assert_eq!(String::from_utf8_lossy(&checkpoint.stdout).trim(), "cp-0001");

    let slot = repo.path().join(".foreman/workspaces/slot-0");
    let commit = Command::new("git")
        .args(["commit", "-q", "--allow-empty", "-m", "moved behind foreman's back"])
        .current_dir(&slot)
        .status()
        .expect("git commit");
    assert!(commit.success());

    let resume = foreman(repo.path(), &["run", "--resume", "cp-0001"]);
    assert_eq!(resume.status.code(), Some(exit_codes::CHECKPOINT_INCONSISTENT));
    let err = stderr(&resume);
    assert!(err.contains("error: kind=consistency"), "{err}");
    assert!(err.contains("foreman/task-1"), "{err}");
}

#[test]
fn checkpoints_lists_what_checkpoint_created() {
    let repo = TestRepo::new();
    let dir = tempfile::tempdir().expect("tempdir");
    init_and_plan(&repo, "2", &dir, TWO_TASKS);

    for reason in ["first", "second"] {
        let out = foreman(repo.path(), &["checkpoint", reason]);
        assert!(out.status.success(), "{}", stderr(&out));
    }
    let list = foreman(repo.path(), &["checkpoints"]);
    assert!(list.status.success(), "{}", stderr(&list));
    let stdout = String::from_utf8_lossy(&list.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{stdout}");
    assert!(lines[0].starts_with("cp-0001 ") && lines[0].contains(" first "));
    assert!(lines[1].starts_with("cp-0002 ") && lines[1].contains("pending=2"));
}
