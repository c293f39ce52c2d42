//! Final verification pass run in REVIEW.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::process::{CancelFlag, run_command};
use crate::core::types::{Task, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub task_id: TaskId,
    pub command: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    /// Integrated project root.
    pub workdir: PathBuf,
    pub log_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Verifier {
    fn verify(&self, tasks: &[&Task], request: &VerifyRequest) -> Result<VerificationReport>;
}

/// Runs each Done task's `verification_command` through `sh -c`.
pub struct CommandVerifier;

impl Verifier for CommandVerifier {
    fn verify(&self, tasks: &[&Task], request: &VerifyRequest) -> Result<VerificationReport> {
        let mut report = VerificationReport::default();
        for task in tasks {
            if task.status != TaskStatus::Done {
                continue;
            }
            let Some(command) = task.verification_command.as_deref() else {
                continue;
            };
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command).current_dir(&request.workdir);
            let output = run_command(
                cmd,
                None,
                request.timeout,
                request.output_limit_bytes,
                &CancelFlag::new(),
            )
            .with_context(|| format!("run verification for task {}", task.id))?;

            let passed = output.status.success() && !output.timed_out;
            let log_path = request.log_dir.join(format!("task-{}.log", task.id));
            write_verify_log(&log_path, &output.stdout, &output.stderr, output.timed_out)?;
            if passed {
                info!(task_id = %task.id, "verification passed");
            } else {
                warn!(task_id = %task.id, exit_code = ?output.status.code(), "verification failed");
            }
            report.checks.push(CheckResult {
                task_id: task.id,
                command: command.to_string(),
                passed,
            });
        }
        Ok(report)
    }
}

fn write_verify_log(path: &Path, stdout: &[u8], stderr: &[u8], timed_out: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(stdout));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(stderr));
    if timed_out {
        buf.push_str("\n[verification timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write verify log {}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn done(id: u32, command: Option<&str>) -> Task {
        let mut task = Task::new(id, format!("task {id}"));
        task.status = TaskStatus::Done;
        task.verification_command = command.map(ToString::to_string);
        task
    }

    #[test]
    fn runs_commands_of_done_tasks_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = VerifyRequest {
            workdir: temp.path().to_path_buf(),
            log_dir: temp.path().join("logs"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1_000,
        };
        let mut failed = done(3, Some("exit 1"));
        failed.status = TaskStatus::Failed;
        let tasks = [done(1, Some("true")), done(2, None), failed];
        let refs: Vec<&Task> = tasks.iter().collect();

        let report = CommandVerifier.verify(&refs, &request).expect("verify");
        assert_eq!(report.checks.len(), 1);
        assert!(report.passed());
        assert!(temp.path().join("logs/task-1.log").exists());
    }

    #[test]
    fn failing_command_fails_the_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = VerifyRequest {
            workdir: temp.path().to_path_buf(),
            log_dir: temp.path().join("logs"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1_000,
        };
        let tasks = [done(1, Some("echo broken >&2; exit 3"))];
        let refs: Vec<&Task> = tasks.iter().collect();
        let report = CommandVerifier.verify(&refs, &request).expect("verify");
        assert!(!report.passed());
        let log = fs::read_to_string(temp.path().join("logs/task-1.log")).expect("log");
        assert!(log.contains("broken"));
    }
}
