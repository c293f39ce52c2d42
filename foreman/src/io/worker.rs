//! Worker abstraction for task execution.
//!
//! The [`Worker`] trait decouples the scheduler from whatever performs a
//! task's content. [`CommandWorker`] runs a configured command inside the
//! workspace; tests use scripted workers that return canned outcomes.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use super::brief::render_task_brief;
use super::process::{CancelFlag, CommandOutput, run_command};
use crate::core::types::{AttemptContext, Task, WorkerOutcome};
use crate::error::{WorkerCancelled, WorkerTimedOut, WorkerUnavailable};

/// Everything a worker needs for one attempt.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub task: Task,
    /// Prepared workspace with the task branch checked out.
    pub workspace: PathBuf,
    pub attempt: AttemptContext,
    /// Where the worker must write its JSON result.
    pub output_path: PathBuf,
    /// Where the attempt's stdout/stderr log goes.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub cancel: CancelFlag,
}

/// Performs a task inside a workspace.
///
/// `Ok` carries the worker's verdict. Errors are crashes, except
/// [`WorkerTimedOut`] and [`WorkerCancelled`], which callers downcast.
pub trait Worker: Send + Sync {
    fn run(&self, request: &WorkerRequest) -> Result<WorkerOutcome>;
}

/// A program that cannot be found or executed becomes [`WorkerUnavailable`];
/// anything else stays a plain error.
fn spawn_failure(program: &str, err: anyhow::Error) -> anyhow::Error {
    let unavailable = err
        .downcast_ref::<std::io::Error>()
        .is_some_and(|io| {
            matches!(io.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied)
        });
    if unavailable {
        WorkerUnavailable {
            program: program.to_string(),
            reason: format!("{err:#}"),
        }
        .into()
    } else {
        err.context("run worker command")
    }
}

/// Worker that spawns the configured `worker.command`.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandWorker {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }
}

impl Worker for CommandWorker {
    #[instrument(skip_all, fields(task_id = %request.task.id, attempt = request.attempt.attempt))]
    fn run(&self, request: &WorkerRequest) -> Result<WorkerOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker.command is empty"))?;
        info!(workspace = %request.workspace.display(), program, "starting worker");

        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        if request.output_path.exists() {
            fs::remove_file(&request.output_path).with_context(|| {
                format!("remove stale output {}", request.output_path.display())
            })?;
        }

        let brief = render_task_brief(
            &request.task,
            &request.attempt,
            &request.workspace,
            &request.output_path,
        )
        .context("render task brief")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workspace)
            .env("FOREMAN_TASK_ID", request.task.id.to_string())
            .env("FOREMAN_WORKSPACE", &request.workspace)
            .env("FOREMAN_OUTPUT_PATH", &request.output_path)
            .env("FOREMAN_ATTEMPT", request.attempt.attempt.to_string());
        if let Some(level) = request.attempt.level {
            cmd.env("FOREMAN_LEVEL", level.as_str());
        }

        let output = run_command(
            cmd,
            Some(brief.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
            &request.cancel,
        )
        .map_err(|err| spawn_failure(program, err))?;

        write_worker_log(&request.log_path, &output, self.output_limit_bytes)?;

        if output.cancelled {
            return Err(WorkerCancelled.into());
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "worker timed out");
            return Err(WorkerTimedOut {
                after_secs: request.timeout.as_secs(),
            }
            .into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "worker failed");
            return Err(anyhow!(
                "worker exited with status {:?}",
                output.status.code()
            ));
        }

        let outcome = read_outcome(&request.output_path)?;
        debug!(outcome = ?outcome, "parsed worker outcome");
        Ok(outcome)
    }
}

fn read_outcome(path: &Path) -> Result<WorkerOutcome> {
    if !path.exists() {
        return Err(anyhow!("missing worker output {}", path.display()));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read worker output {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_worker_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create worker log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice("worker"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice("worker"));
    if output.timed_out {
        buf.push_str("\n[worker timed out]\n");
    }
    if output.cancelled {
        buf.push_str("\n[worker cancelled]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        return fs::write(path, truncated)
            .with_context(|| format!("write worker log {}", path.display()));
    }

    fs::write(path, buf).with_context(|| format!("write worker log {}", path.display()))
}
