//! Session driver: plan a graph, then walk EXECUTE -> INTEGRATE -> REVIEW ->
//! COMPLETE, stopping early on handoff, stuck tasks, conflicts or failed
//! verification. Also resume, manual checkpoints and requeue.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::escalation::StuckReport;
use crate::core::events::Event;
use crate::core::types::{Phase, TaskId};
use crate::error::ConflictDetected;
use crate::io::checkpoint::Checkpoint;
use crate::io::git::Git;
use crate::io::graph_store::load_graph;
use crate::io::handoff::consume_handoff;
use crate::io::verify::{VerificationReport, VerifyRequest};
use crate::merger::{IntegrateOutcome, integrate, mark_resolved};
use crate::runtime::Runtime;
use crate::scheduler::{ExecuteStop, execute, reconcile};

/// Checkpoint id accepted by `run --resume` meaning the newest live one.
pub const LATEST: &str = "latest";

/// Why `run` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Verification passed; phase is COMPLETE.
    Complete,
    /// Escalation reached Ask for these tasks; phase stays EXECUTE.
    Stuck { reports: Vec<StuckReport> },
    /// Token budget exhausted; phase is CHECKPOINTED.
    Handoff { checkpoint_id: String },
    /// Integration halted; phase stays INTEGRATE.
    Conflict(ConflictDetected),
    /// Verification failed; phase stays REVIEW.
    VerificationFailed(VerificationReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub tasks: usize,
    pub target_branch: String,
}

/// Load the task graph and move IDLE -> PLAN -> EXECUTE.
///
/// A rejected graph leaves the state in PLAN so a corrected graph can be
/// planned again.
#[instrument(skip_all, fields(graph = %graph_path.display()))]
pub fn plan(rt: &mut Runtime, graph_path: &Path) -> Result<PlanSummary> {
    match rt.state.current_phase {
        Phase::Idle => rt.transition(Phase::Plan)?,
        Phase::Plan => {}
        phase => {
            return Err(anyhow!(
                "a graph is already planned (phase is {phase}); start from a fresh `foreman init`"
            ));
        }
    }
    let tasks = load_graph(graph_path)?;
    let target_branch = match rt.config.target_branch.clone() {
        Some(branch) => branch,
        None => Git::new(rt.paths.root())
            .current_branch()
            .context("detect target branch (set `target_branch` in config)")?,
    };

    let count = tasks.len();
    rt.state.tasks = tasks;
    rt.state.target_branch = Some(target_branch.clone());
    rt.transition(Phase::Execute)?;
    info!(tasks = count, target_branch = %target_branch, "graph planned");
    Ok(PlanSummary {
        tasks: count,
        target_branch,
    })
}

/// Drive the session from the current phase until it completes or stops.
///
/// With `resume`, the state is first restored from that checkpoint (or
/// [`LATEST`]). Stuck tasks stop the session in EXECUTE unless
/// `accept_failed` lets integration go ahead with the Done tasks.
#[instrument(skip_all, fields(resume = ?resume, accept_failed))]
pub fn run(rt: &mut Runtime, resume: Option<&str>, accept_failed: bool) -> Result<SessionOutcome> {
    if let Some(id) = resume {
        resume_from(rt, id)?;
    }
    let git = Git::new(rt.paths.root());
    loop {
        match rt.state.current_phase {
            Phase::Idle | Phase::Plan => {
                return Err(anyhow!("no task graph planned (run `foreman plan <graph>` first)"));
            }
            Phase::Checkpointed => {
                return Err(anyhow!(
                    "session was handed off; continue with `foreman run --resume {LATEST}`"
                ));
            }
            Phase::Execute => match execute(rt)? {
                ExecuteStop::Handoff { checkpoint_id } => {
                    return Ok(SessionOutcome::Handoff { checkpoint_id });
                }
                ExecuteStop::Drained => {
                    if !rt.state.stuck_reports.is_empty() && !accept_failed {
                        warn!(stuck = rt.state.stuck_reports.len(), "stopping with stuck tasks");
                        return Ok(SessionOutcome::Stuck {
                            reports: rt.state.stuck_reports.clone(),
                        });
                    }
                    rt.transition(Phase::Integrate)?;
                }
            },
            Phase::Integrate => match integrate(rt, &git)? {
                IntegrateOutcome::Conflict(conflict) => {
                    return Ok(SessionOutcome::Conflict(conflict));
                }
                IntegrateOutcome::Integrated { .. } => rt.transition(Phase::Review)?,
            },
            Phase::Review => {
                let report = review(rt)?;
                if !report.passed() {
                    return Ok(SessionOutcome::VerificationFailed(report));
                }
                rt.transition(Phase::Complete)?;
            }
            Phase::Complete => return Ok(SessionOutcome::Complete),
        }
    }
}

/// Restore `id`, consume any handoff signal and start a new session.
///
/// Slots left Busy are reconciled: partial ones are charged a Transient
/// failure, the rest go back to Pending.
#[instrument(skip_all, fields(checkpoint_id = id))]
pub fn resume_from(rt: &mut Runtime, id: &str) -> Result<Checkpoint> {
    let id = if id == LATEST {
        rt.checkpoints
            .latest()?
            .map(|checkpoint| checkpoint.id)
            .ok_or_else(|| anyhow!("no checkpoint to resume from"))?
    } else {
        id.to_string()
    };
    let checkpoint = rt.checkpoints.restore(&id, rt.collab.backend.as_ref())?;
    rt.state = checkpoint.state.clone();
    if let Some(signal) = consume_handoff(&rt.paths.handoff_path)? {
        if signal.checkpoint_id != checkpoint.id {
            warn!(
                signal = %signal.checkpoint_id,
                resumed = %checkpoint.id,
                "resuming from a different checkpoint than the handoff named"
            );
        }
    }
    if rt.state.current_phase == Phase::Checkpointed {
        let to = rt
            .state
            .resume_phase
            .ok_or_else(|| anyhow!("checkpoint {id} has no resume phase"))?;
        rt.transition(to)?;
    }
    reconcile(rt, &checkpoint.partial_slots())?;

    rt.state.token_budget.reset_for_session();
    rt.state.session += 1;
    let at = rt.now();
    let session = rt.state.session;
    rt.state
        .record(at, format!("session {session} resumed from {id}"));
    rt.persist()?;
    info!(session, phase = %rt.state.current_phase, "resumed");
    Ok(checkpoint)
}

/// `foreman merge`: integrate Done branches, optionally after an external
/// conflict resolution. Leaves EXECUTE first if every task is terminal, and
/// enters REVIEW once everything is merged.
#[instrument(skip_all, fields(target = ?target, resolved))]
pub fn merge(rt: &mut Runtime, target: Option<&str>, resolved: bool) -> Result<IntegrateOutcome> {
    if rt.state.current_phase == Phase::Execute {
        rt.transition(Phase::Integrate)?;
    }
    if let Some(target) = target {
        let started = !rt.state.merge.merged.is_empty() || rt.state.merge.conflict.is_some();
        match rt.state.target_branch.as_deref() {
            Some(current) if current == target => {}
            Some(current) if started => {
                return Err(anyhow!(
                    "integration into {current} already started; cannot switch to {target}"
                ));
            }
            _ => {
                info!(target, "integration target set");
                rt.state.target_branch = Some(target.to_string());
                rt.persist()?;
            }
        }
    }
    let git = Git::new(rt.paths.root());
    if resolved {
        mark_resolved(rt, &git)?;
    }
    let outcome = integrate(rt, &git)?;
    if matches!(outcome, IntegrateOutcome::Integrated { .. }) {
        rt.transition(Phase::Review)?;
    }
    Ok(outcome)
}

/// Run every Done task's verification command against the integrated tree.
pub fn review(rt: &mut Runtime) -> Result<VerificationReport> {
    let request = VerifyRequest {
        workdir: rt.paths.root().to_path_buf(),
        log_dir: rt.paths.logs_dir.join("verify"),
        timeout: Duration::from_secs(rt.config.verify.timeout_secs),
        output_limit_bytes: rt.config.output_limit_bytes,
    };
    let tasks: Vec<_> = rt.state.tasks.values().collect();
    let report = rt.collab.verifier.verify(&tasks, &request)?;
    let passed = report.passed();
    rt.state.verification_passed = passed;
    let at = rt.now();
    rt.state.record(
        at,
        format!("verification {}", if passed { "passed" } else { "failed" }),
    );
    rt.persist()?;
    rt.emit(Event::VerificationFinished { passed })?;
    Ok(report)
}

/// Operator-requested checkpoint of the current state.
pub fn checkpoint(rt: &mut Runtime, reason: &str) -> Result<Checkpoint> {
    rt.checkpoint(reason, &BTreeSet::new())
}

/// Re-open a Failed task at Retry level.
pub fn requeue(rt: &mut Runtime, task_id: TaskId) -> Result<()> {
    let at = rt.now();
    rt.state.requeue(task_id, at)?;
    rt.persist()?;
    info!(task_id = %task_id, "task requeued");
    Ok(())
}
