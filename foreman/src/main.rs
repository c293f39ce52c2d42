//! `foreman`: schedules a task graph onto a pool of git worktrees, escalates
//! failures, checkpoints, hands off when the token budget runs low and
//! integrates the results.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use foreman::core::types::{SlotId, TaskId};
use foreman::error::error_kind;
use foreman::exit_codes;
use foreman::logging;
use foreman::merger::IntegrateOutcome;
use foreman::pool;
use foreman::report::FinalReport;
use foreman::runtime::{Collaborators, Runtime};
use foreman::session::{self, SessionOutcome};

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Autonomous task execution orchestrator"
)]
struct Cli {
    /// Project root (a git repository).
    #[arg(short = 'C', long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.foreman/` with `size` workspace slots (or resize an idle pool).
    Init { size: Option<u32> },
    /// Claim a slot for a ready task and provision its worktree.
    Acquire { task_id: u32 },
    /// Return a slot to the pool.
    Release {
        slot_id: u32,
        /// Commit the workspace to the task branch and mark the task done.
        #[arg(long)]
        keep: bool,
    },
    /// Show slots and task progress.
    Status {
        /// Print state as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Integrate done task branches into the target branch.
    Merge {
        target: Option<String>,
        /// The pending conflict was resolved by hand; continue integration.
        #[arg(long)]
        resolved: bool,
    },
    /// Remove all slot worktrees.
    Cleanup {
        #[arg(long)]
        force: bool,
    },
    /// Check that busy slots still have their worktrees on the right branch.
    Health,
    /// Load a task graph and enter EXECUTE.
    Plan { graph: PathBuf },
    /// Run the session until complete, stuck, conflicted or handed off.
    Run {
        /// Checkpoint id to restore first, or `latest`.
        #[arg(long)]
        resume: Option<String>,
        /// Integrate the done tasks even if some tasks are stuck.
        #[arg(long)]
        accept_failed: bool,
    },
    /// Take a checkpoint now.
    Checkpoint {
        #[arg(default_value = "manual")]
        reason: String,
    },
    /// List live checkpoints.
    Checkpoints,
    /// Re-open a failed task at retry level.
    Requeue { task_id: u32 },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let message = format!("{err:#}").replace('\n', " ");
            eprintln!("error: kind={} message={}", error_kind(&err), message);
            std::process::exit(exit_codes::for_error(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { size } => {
            let paths = pool::init(root, size)?;
            println!("initialized {}", paths.foreman_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Acquire { task_id } => {
            let mut rt = open(root)?;
            let slot_id = pool::acquire(&mut rt, TaskId(task_id))?;
            let path = rt
                .state
                .slots
                .get(slot_id)
                .map(|slot| slot.path.display().to_string())
                .unwrap_or_default();
            println!("{slot_id} {path}");
            Ok(exit_codes::OK)
        }
        Command::Release { slot_id, keep } => {
            let mut rt = open(root)?;
            match pool::release(&mut rt, SlotId(slot_id), keep)? {
                Some(task_id) => println!("slot {slot_id} released (task {task_id})"),
                None => println!("slot {slot_id} was idle"),
            }
            Ok(exit_codes::OK)
        }
        Command::Status { json } => {
            let rt = open(root)?;
            if json {
                let out = serde_json::to_string_pretty(&rt.state).context("serialize state")?;
                println!("{out}");
            } else {
                for slot in pool::status(&rt) {
                    let task = slot
                        .assigned_task
                        .map_or_else(|| "-".to_string(), |task| task.to_string());
                    println!(
                        "slot {} {:?} task={} branch={} path={}",
                        slot.id,
                        slot.status,
                        task,
                        slot.branch.as_deref().unwrap_or("-"),
                        slot.path.display()
                    );
                }
                print!("{}", FinalReport::from_state(&rt.state));
            }
            Ok(exit_codes::OK)
        }
        Command::Merge { target, resolved } => {
            let mut rt = open(root)?;
            match session::merge(&mut rt, target.as_deref(), resolved)? {
                IntegrateOutcome::Integrated { merged } => {
                    println!("merged {} branch(es)", merged.len());
                    Ok(exit_codes::OK)
                }
                IntegrateOutcome::Conflict(conflict) => Err(conflict.into()),
            }
        }
        Command::Cleanup { force } => {
            let mut rt = open(root)?;
            let removed = pool::cleanup(&mut rt, force)?;
            println!("removed {removed} workspace(s)");
            Ok(exit_codes::OK)
        }
        Command::Health => {
            let rt = open(root)?;
            let checked = pool::health(&rt)?;
            println!("{checked} busy slot(s) healthy");
            Ok(exit_codes::OK)
        }
        Command::Plan { graph } => {
            let mut rt = open(root)?;
            let summary = session::plan(&mut rt, &graph)?;
            println!(
                "planned {} task(s) onto {}",
                summary.tasks, summary.target_branch
            );
            Ok(exit_codes::OK)
        }
        Command::Run {
            resume,
            accept_failed,
        } => {
            let mut rt = open(root)?;
            let outcome = session::run(&mut rt, resume.as_deref(), accept_failed)?;
            print!("{}", FinalReport::from_state(&rt.state));
            match &outcome {
                SessionOutcome::Complete => println!("complete"),
                SessionOutcome::Stuck { reports } => {
                    println!("stopped: {} stuck task(s)", reports.len());
                }
                SessionOutcome::Handoff { checkpoint_id } => {
                    println!("handoff: resume with `foreman run --resume {checkpoint_id}`");
                }
                SessionOutcome::Conflict(conflict) => {
                    println!("conflict: {conflict}");
                }
                SessionOutcome::VerificationFailed(report) => {
                    for check in report.checks.iter().filter(|check| !check.passed) {
                        println!("verification failed for task {}: {}", check.task_id, check.command);
                    }
                }
            }
            Ok(exit_codes::for_outcome(&outcome))
        }
        Command::Checkpoint { reason } => {
            let mut rt = open(root)?;
            let checkpoint = session::checkpoint(&mut rt, &reason)?;
            println!("{}", checkpoint.id);
            Ok(exit_codes::OK)
        }
        Command::Checkpoints => {
            let rt = open(root)?;
            for summary in rt.checkpoints.list()? {
                println!(
                    "{} {} {} phase={} done={} pending={}",
                    summary.id,
                    summary.created_at.to_rfc3339(),
                    summary.reason,
                    summary.phase,
                    summary.completed,
                    summary.pending
                );
            }
            Ok(exit_codes::OK)
        }
        Command::Requeue { task_id } => {
            let mut rt = open(root)?;
            session::requeue(&mut rt, TaskId(task_id))?;
            println!("task {task_id} requeued");
            Ok(exit_codes::OK)
        }
    }
}

fn open(root: &Path) -> Result<Runtime> {
    Runtime::open(root, Collaborators::from_config)
}
