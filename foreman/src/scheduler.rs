//! Coordinator loop for the EXECUTE phase.
//!
//! One thread owns the [`Runtime`]. Each dispatched task runs on its own
//! worker thread which provisions the slot, runs the worker, commits or
//! discards the result and reports back over a channel. The coordinator
//! applies every report to state, enforces per-task timeouts and reacts to
//! the token budget.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::BudgetSignal;
use crate::core::escalation::{
    Decision, FailureRecord, SuccessDisposition, record_failure, record_success, stuck_report,
};
use crate::core::events::Event;
use crate::core::selector::{UNREACHABLE_DEPENDENCY, next_dispatch, skip_unreachable};
use crate::core::types::{
    AttemptContext, EscalationLevel, Phase, SlotId, SlotStatus, Task, TaskId, TaskStatus,
    WorkerOutcome, task_branch,
};
use crate::error::{
    FailureKind, UnknownSlot, WorkerTimedOut, WorkerUnavailable, WorkspaceUnavailable,
};
use crate::io::handoff::{HandoffSignal, write_handoff};
use crate::io::process::CancelFlag;
use crate::io::strategies::Learning;
use crate::io::worker::{Worker, WorkerRequest};
use crate::io::workspace::{PrepareRequest, WorkspaceBackend};
use crate::runtime::Runtime;

/// How often the coordinator wakes to run the watchdog when no report arrives.
const TICK: Duration = Duration::from_millis(50);

pub const INTERRUPTED_BY_HANDOFF: &str = "interrupted by handoff";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteStop {
    /// Every task is Done, Failed or Skipped.
    Drained,
    /// The token budget crossed the handoff threshold; state is CHECKPOINTED.
    Handoff { checkpoint_id: String },
}

struct Finished {
    slot_id: SlotId,
    task_id: TaskId,
    result: Result<WorkerOutcome>,
}

struct InFlight {
    task_id: TaskId,
    cancel: CancelFlag,
    deadline: Instant,
    timed_out: bool,
    handle: JoinHandle<()>,
}

/// Run tasks until the graph drains or a handoff is requested.
///
/// Busy slots left over from an earlier process are returned to the pool
/// first; their tasks go back to Pending.
#[instrument(skip_all, fields(session = rt.state.session))]
pub fn execute(rt: &mut Runtime) -> Result<ExecuteStop> {
    if rt.state.current_phase != Phase::Execute {
        return Err(anyhow!(
            "tasks only run in {} (phase is {})",
            Phase::Execute,
            rt.state.current_phase
        ));
    }
    let base = rt
        .state
        .target_branch
        .clone()
        .ok_or_else(|| anyhow!("no target branch recorded (run `foreman plan` first)"))?;
    reconcile(rt, &BTreeSet::new())?;
    Coordinator::new(base).run(rt)
}

/// Release every Busy slot after a restart and put its task back in line.
///
/// Every task goes back to Pending. A handoff is not a failure, so tasks on
/// `partial` slots keep their escalation counters; the interruption is only
/// noted in history.
pub fn reconcile(rt: &mut Runtime, partial: &BTreeSet<SlotId>) -> Result<()> {
    let busy: Vec<(SlotId, TaskId, PathBuf)> = rt
        .state
        .slots
        .slots()
        .iter()
        .filter(|slot| slot.status == SlotStatus::Busy)
        .filter_map(|slot| slot.assigned_task.map(|task| (slot.id, task, slot.path.clone())))
        .collect();
    for (slot_id, task_id, path) in busy {
        info!(slot_id = %slot_id, task_id = %task_id, "releasing slot left busy by an earlier session");
        if let Err(err) = rt.collab.backend.reset(&path) {
            warn!(slot_id = %slot_id, err = %format!("{err:#}"), "could not reset workspace");
        }
        rt.state.slots.release(slot_id)?;
        rt.emit(Event::SlotReleased { slot_id, task_id })?;
        let task = rt.state.task_mut(task_id)?;
        task.status = TaskStatus::Pending;
        if partial.contains(&slot_id) {
            task.outcome_note = None;
            let at = rt.now();
            rt.state
                .record(at, format!("task {task_id} {INTERRUPTED_BY_HANDOFF}"));
        }
        rt.persist()?;
    }
    Ok(())
}

struct Coordinator {
    base: String,
    tx: Sender<Finished>,
    rx: Receiver<Finished>,
    flight: BTreeMap<SlotId, InFlight>,
    /// Set once a handoff is requested: end of the grace period.
    handoff: Option<Instant>,
    partial: BTreeSet<SlotId>,
    approvals_since_checkpoint: u32,
}

impl Coordinator {
    fn new(base: String) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            base,
            tx,
            rx,
            flight: BTreeMap::new(),
            handoff: None,
            partial: BTreeSet::new(),
            approvals_since_checkpoint: 0,
        }
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<ExecuteStop> {
        skip_blocked(rt)?;
        loop {
            if self.handoff.is_none() {
                self.dispatch(rt)?;
            }
            if self.flight.is_empty() {
                if self.handoff.is_some() {
                    return self.hand_off(rt);
                }
                if rt.state.all_terminal() {
                    info!(
                        done = rt.state.ids_with_status(TaskStatus::Done).len(),
                        failed = rt.state.ids_with_status(TaskStatus::Failed).len(),
                        skipped = rt.state.ids_with_status(TaskStatus::Skipped).len(),
                        "task graph drained"
                    );
                    return Ok(ExecuteStop::Drained);
                }
                return Err(anyhow!(
                    "scheduler stalled: no task is ready and none is running"
                ));
            }
            match self.rx.recv_timeout(TICK) {
                Ok(finished) => self.on_finished(rt, finished)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("worker report channel closed"));
                }
            }
            self.watchdog();
        }
    }

    fn dispatch(&mut self, rt: &mut Runtime) -> Result<()> {
        for task_id in next_dispatch(&rt.state.tasks, &rt.state.slots, rt.config.max_agents) {
            self.start(rt, task_id)?;
        }
        Ok(())
    }

    fn start(&mut self, rt: &mut Runtime, task_id: TaskId) -> Result<()> {
        let attempt = attempt_context(rt, rt.state.task(task_id)?);
        let slot_id = rt.state.slots.acquire(task_id)?;
        let workspace = rt
            .state
            .slots
            .get(slot_id)
            .map(|slot| slot.path.clone())
            .ok_or(UnknownSlot(slot_id))?;
        let task = {
            let task = rt.state.task_mut(task_id)?;
            task.status = TaskStatus::Assigned;
            task.clone()
        };
        rt.persist()?;
        rt.emit(Event::TaskAssigned {
            task_id,
            slot_id,
            attempt: attempt.attempt,
            level: attempt.level,
        })?;

        let timeout = Duration::from_secs(rt.config.task_timeout_secs);
        let cancel = CancelFlag::new();
        let prepare = PrepareRequest {
            branch: task.branch_name(),
            base: self.base.clone(),
            inputs: task.depends_on.iter().map(|dep| task_branch(*dep)).collect(),
        };
        let request = WorkerRequest {
            output_path: rt.paths.attempt_output_path(task_id, attempt.attempt),
            log_path: rt.paths.attempt_log_path(task_id, attempt.attempt),
            task,
            workspace,
            attempt,
            timeout,
            cancel: cancel.clone(),
        };
        let worker = Arc::clone(&rt.collab.worker);
        let backend = Arc::clone(&rt.collab.backend);
        let tx = self.tx.clone();
        let handle = thread::Builder::new()
            .name(format!("foreman-task-{task_id}"))
            .spawn(move || {
                let result =
                    run_in_slot(backend.as_ref(), worker.as_ref(), slot_id, &prepare, &request);
                if tx
                    .send(Finished {
                        slot_id,
                        task_id,
                        result,
                    })
                    .is_err()
                {
                    debug!(task_id = %task_id, "coordinator gone before worker finished");
                }
            })
            .with_context(|| format!("spawn worker thread for task {task_id}"))?;

        debug!(task_id = %task_id, slot_id = %slot_id, "worker dispatched");
        self.flight.insert(
            slot_id,
            InFlight {
                task_id,
                cancel,
                deadline: Instant::now() + timeout,
                timed_out: false,
                handle,
            },
        );
        Ok(())
    }

    fn on_finished(&mut self, rt: &mut Runtime, finished: Finished) -> Result<()> {
        let Finished {
            slot_id,
            task_id,
            result,
        } = finished;
        let flight = self
            .flight
            .remove(&slot_id)
            .ok_or_else(|| anyhow!("report from slot {slot_id} with no running worker"))?;
        if flight.handle.join().is_err() {
            warn!(task_id = %task_id, "worker thread panicked after reporting");
        }

        if self.partial.contains(&slot_id) {
            if result.is_err() {
                info!(task_id = %task_id, slot_id = %slot_id, "worker stopped for handoff");
                return Ok(());
            }
            self.partial.remove(&slot_id);
        }

        match result {
            Ok(outcome) => {
                self.observe_tokens(rt, outcome.tokens_used())?;
                match outcome {
                    WorkerOutcome::Approved { evidence, .. } => {
                        self.complete(rt, slot_id, task_id, evidence)
                    }
                    WorkerOutcome::Rejected { reason, kind, .. } => {
                        info!(task_id = %task_id, kind = %kind, reason = %reason, "worker rejected task");
                        rt.state.slots.release(slot_id)?;
                        rt.emit(Event::SlotReleased { slot_id, task_id })?;
                        apply_failure(rt, task_id, kind, &reason)
                    }
                }
            }
            Err(err) => {
                let (kind, reason) = classify_error(&err, flight.timed_out);
                warn!(task_id = %task_id, kind = %kind, err = %format!("{err:#}"), "attempt failed");
                rt.state.slots.release(slot_id)?;
                rt.emit(Event::SlotReleased { slot_id, task_id })?;
                apply_failure(rt, task_id, kind, &reason)
            }
        }
    }

    fn complete(
        &mut self,
        rt: &mut Runtime,
        slot_id: SlotId,
        task_id: TaskId,
        evidence: String,
    ) -> Result<()> {
        let at = rt.now();
        rt.state.slots.release(slot_id)?;
        let description = {
            let task = rt.state.task_mut(task_id)?;
            task.status = TaskStatus::Done;
            task.outcome_note = Some(evidence.clone());
            task.description.clone()
        };
        if let Some(record) = rt.state.failures.get_mut(&task_id) {
            match record_success(record) {
                SuccessDisposition::Clear => {
                    rt.state.failures.remove(&task_id);
                }
                SuccessDisposition::Resolved(level) => {
                    info!(task_id = %task_id, level = %level, "task recovered after escalation");
                    if level == EscalationLevel::Research {
                        let learning = Learning {
                            at,
                            task_id,
                            description,
                            resolved_via: level,
                            failed_attempts: stuck_report(record, "").attempts_summary,
                            evidence: evidence.clone(),
                        };
                        if let Err(err) = rt.collab.learnings.record(&learning) {
                            warn!(task_id = %task_id, err = %format!("{err:#}"), "could not record learning");
                        }
                    }
                }
            }
        }
        rt.state.record(at, format!("task {task_id} done"));
        rt.persist()?;
        rt.emit(Event::SlotReleased { slot_id, task_id })?;
        rt.emit(Event::TaskDone { task_id, evidence })?;

        self.approvals_since_checkpoint += 1;
        let every = rt.config.checkpoint_every;
        if every > 0 && self.handoff.is_none() && self.approvals_since_checkpoint >= every {
            self.approvals_since_checkpoint = 0;
            rt.checkpoint("progress", &BTreeSet::new())?;
        }
        Ok(())
    }

    fn observe_tokens(&mut self, rt: &mut Runtime, tokens: u64) -> Result<()> {
        if tokens == 0 {
            return Ok(());
        }
        for signal in rt.state.token_budget.add(tokens) {
            match signal {
                BudgetSignal::CompressionHint { used, max } => {
                    info!(used, max, "token budget warning threshold crossed");
                    rt.emit(Event::CompressionHint { used, max })?;
                }
                BudgetSignal::HandoffRequested { used, max } => {
                    warn!(used, max, "token budget handoff threshold crossed");
                    rt.emit(Event::HandoffRequested { used, max })?;
                    if self.handoff.is_none() {
                        self.handoff =
                            Some(Instant::now() + Duration::from_secs(rt.config.handoff_grace_secs));
                    }
                }
            }
        }
        Ok(())
    }

    /// Cancel workers past their deadline, and everything still running once
    /// the handoff grace period ends.
    fn watchdog(&mut self) {
        let now = Instant::now();
        for (slot_id, flight) in &mut self.flight {
            if !flight.timed_out && now >= flight.deadline {
                warn!(task_id = %flight.task_id, slot_id = %slot_id, "task timed out, cancelling worker");
                flight.timed_out = true;
                flight.cancel.cancel();
            }
        }
        if self.handoff.is_some_and(|grace_end| now >= grace_end) {
            for (slot_id, flight) in &self.flight {
                if self.partial.insert(*slot_id) {
                    info!(task_id = %flight.task_id, slot_id = %slot_id, "cancelling worker for handoff");
                    flight.cancel.cancel();
                }
            }
        }
    }

    fn hand_off(&mut self, rt: &mut Runtime) -> Result<ExecuteStop> {
        rt.transition(Phase::Checkpointed)?;
        let checkpoint = rt.checkpoint("handoff", &self.partial)?;
        let usage = checkpoint.token_usage;
        write_handoff(
            &rt.paths.handoff_path,
            &HandoffSignal {
                checkpoint_id: checkpoint.id.clone(),
                reason: format!(
                    "token budget at {}/{} crossed the handoff threshold",
                    usage.used, usage.max
                ),
                token_usage: usage,
                created_at: rt.now(),
            },
        )?;
        info!(checkpoint_id = %checkpoint.id, partial = self.partial.len(), "handed off");
        Ok(ExecuteStop::Handoff {
            checkpoint_id: checkpoint.id,
        })
    }
}

/// Worker-thread body: provision, run, then commit or discard.
fn run_in_slot(
    backend: &dyn WorkspaceBackend,
    worker: &dyn Worker,
    slot_id: SlotId,
    prepare: &PrepareRequest,
    request: &WorkerRequest,
) -> Result<WorkerOutcome> {
    let result = backend
        .prepare(&request.workspace, prepare)
        .map_err(|err| {
            anyhow::Error::new(WorkspaceUnavailable {
                slot_id,
                reason: format!("{err:#}"),
            })
        })
        .and_then(|()| worker.run(request));
    let result = match result {
        Ok(outcome @ WorkerOutcome::Approved { .. }) => backend
            .commit(
                &request.workspace,
                &format!("foreman: task {}", request.task.id),
            )
            .map(|committed| {
                debug!(task_id = %request.task.id, committed, "approved work committed");
                outcome
            })
            .context("commit approved work"),
        other => other,
    };
    if let Err(err) = backend.reset(&request.workspace) {
        warn!(slot_id = %slot_id, err = %format!("{err:#}"), "could not reset workspace");
    }
    result
}

fn classify_error(err: &anyhow::Error, timed_out: bool) -> (FailureKind, String) {
    if timed_out || err.downcast_ref::<WorkerTimedOut>().is_some() {
        (FailureKind::Logic, "timeout".to_string())
    } else if err.downcast_ref::<WorkspaceUnavailable>().is_some()
        || err.downcast_ref::<WorkerUnavailable>().is_some()
    {
        (FailureKind::Resource, format!("{err:#}"))
    } else {
        (FailureKind::Transient, format!("worker crashed: {err:#}"))
    }
}

/// Guidance for the next dispatch of `task`, from its failure record.
fn attempt_context(rt: &Runtime, task: &Task) -> AttemptContext {
    let Some(record) = rt
        .state
        .failures
        .get(&task.id)
        .filter(|record| !record.attempts.is_empty())
    else {
        return AttemptContext {
            attempt: 1,
            ..AttemptContext::default()
        };
    };
    let mut context = AttemptContext {
        level: Some(record.level),
        attempt: record.next_attempt(),
        last_error: Some(record.last_error.clone()),
        ..AttemptContext::default()
    };
    match record.level {
        EscalationLevel::Pivot => match rt.collab.alternatives.alternative(task, record) {
            Ok(hint) => context.hint = Some(hint),
            Err(err) => warn!(task_id = %task.id, err = %format!("{err:#}"), "no alternative approach"),
        },
        EscalationLevel::Research => match rt.collab.gatherer.gather(task, record) {
            Ok(research) => context.research = Some(research),
            Err(err) => warn!(task_id = %task.id, err = %format!("{err:#}"), "context gathering failed"),
        },
        EscalationLevel::Retry | EscalationLevel::Ask => {}
    }
    context
}

/// Charge one failure to `task_id` and apply the escalation decision.
///
/// The task's slot must already be released.
fn apply_failure(rt: &mut Runtime, task_id: TaskId, kind: FailureKind, error: &str) -> Result<()> {
    let at = rt.now();
    let limits = rt.config.escalation_limits();
    let description = rt.state.task(task_id)?.description.clone();
    let (decision, report, attempts) = {
        let record = rt
            .state
            .failures
            .entry(task_id)
            .or_insert_with(|| FailureRecord::new(task_id));
        let decision = record_failure(record, kind, error, &limits);
        let report = matches!(decision, Decision::Ask | Decision::Abandon { .. })
            .then(|| stuck_report(record, &description));
        (decision, report, record.attempts.len())
    };

    let mut events = vec![Event::TaskFailed {
        task_id,
        kind,
        error: error.to_string(),
    }];
    let task = rt.state.task_mut(task_id)?;
    match decision {
        Decision::Redispatch { level, escalated } => {
            task.status = TaskStatus::Pending;
            task.outcome_note = None;
            if escalated {
                info!(task_id = %task_id, level = %level, "task escalated");
                events.push(Event::TaskEscalated { task_id, level });
            }
        }
        Decision::Ask => {
            warn!(task_id = %task_id, attempts, "escalation exhausted, task is stuck");
            task.status = TaskStatus::Failed;
            task.outcome_note = Some(format!("stuck after {attempts} attempts: {error}"));
        }
        Decision::Abandon { reason } => {
            warn!(task_id = %task_id, reason = %reason, "task abandoned");
            task.status = TaskStatus::Failed;
            task.outcome_note = Some(reason);
        }
    }
    if let Some(report) = report {
        events.push(Event::TaskStuck {
            task_id,
            last_error: report.last_error.clone(),
        });
        rt.state
            .stuck_reports
            .retain(|existing| existing.task_id != task_id);
        rt.state.stuck_reports.push(report);
    }
    rt.state.record(at, format!("task {task_id} failed ({kind}): {error}"));
    for skipped in skip_unreachable(&mut rt.state.tasks) {
        events.push(Event::TaskSkipped {
            task_id: skipped,
            reason: UNREACHABLE_DEPENDENCY.to_string(),
        });
    }
    rt.persist()?;
    for event in events {
        rt.emit(event)?;
    }
    Ok(())
}

fn skip_blocked(rt: &mut Runtime) -> Result<()> {
    let skipped = skip_unreachable(&mut rt.state.tasks);
    if skipped.is_empty() {
        return Ok(());
    }
    rt.persist()?;
    for task_id in skipped {
        rt.emit(Event::TaskSkipped {
            task_id,
            reason: UNREACHABLE_DEPENDENCY.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::io::config::ForemanConfig;
    use crate::io::handoff::read_handoff;
    use crate::io::journal::Journal;
    use crate::io::worker::CommandWorker;
    use crate::test_support::{FakeBackend, ScriptedWorker, Step, fake_runtime, graph};

    fn config(pool_size: u32, max_agents: u32) -> ForemanConfig {
        ForemanConfig {
            pool_size,
            max_agents,
            checkpoint_every: 0,
            ..ForemanConfig::default()
        }
    }

    fn events(rt: &Runtime) -> Vec<Event> {
        Journal::new(&rt.paths.events_path)
            .read_all()
            .expect("journal")
            .into_iter()
            .map(|entry| entry.event)
            .collect()
    }

    #[test]
    fn bounded_concurrency_drains_independent_tasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let slow = || Step::SlowApprove {
            delay: Duration::from_millis(150),
            tokens: 0,
        };
        let worker = Arc::new(
            (1..=5).fold(ScriptedWorker::new(), |worker, id| worker.script(id, [slow()])),
        );
        let mut rt = fake_runtime(
            temp.path(),
            config(5, 3),
            graph(&[(1, &[]), (2, &[]), (3, &[]), (4, &[]), (5, &[])]),
            worker.clone(),
            Arc::new(FakeBackend::default()),
        );

        assert_eq!(execute(&mut rt).expect("execute"), ExecuteStop::Drained);
        assert_eq!(worker.peak_concurrency(), 3);
        assert_eq!(rt.state.ids_with_status(TaskStatus::Done).len(), 5);
        assert_eq!(rt.state.slots.busy_count(), 0);
    }

    #[test]
    fn dependencies_run_in_order_and_most_dependents_go_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(ScriptedWorker::new());
        let mut rt = fake_runtime(
            temp.path(),
            config(1, 1),
            graph(&[(1, &[]), (2, &[]), (3, &[2]), (4, &[2]), (5, &[3, 1])]),
            worker.clone(),
            Arc::new(FakeBackend::default()),
        );
        execute(&mut rt).expect("execute");
        let order: Vec<TaskId> = worker.calls().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![TaskId(2), TaskId(1), TaskId(3), TaskId(4), TaskId(5)]);
    }

    #[test]
    fn three_logic_failures_escalate_to_pivot_with_a_hint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(ScriptedWorker::new().script(
            1,
            [
                Step::reject("test_a fails"),
                Step::reject("test_a fails"),
                Step::reject("test_b fails"),
                Step::approve("green"),
            ],
        ));
        let mut rt = fake_runtime(
            temp.path(),
            config(2, 2),
            graph(&[(1, &[])]),
            worker.clone(),
            Arc::new(FakeBackend::default()),
        );
        execute(&mut rt).expect("execute");

        let calls = worker.calls_for(1);
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3].level, Some(EscalationLevel::Pivot));
        assert!(calls[3].hint.as_deref().expect("hint").contains("test_b fails"));
        let record = &rt.state.failures[&TaskId(1)];
        assert_eq!(record.resolved_via, Some(EscalationLevel::Pivot));
        assert_eq!((record.retry_count, record.pivot_count), (0, 0));
        assert!(events(&rt).contains(&Event::TaskEscalated {
            task_id: TaskId(1),
            level: EscalationLevel::Pivot,
        }));
    }

    #[test]
    fn exhausted_ladder_reports_stuck_and_skips_dependents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(
            ScriptedWorker::new().script(1, std::iter::repeat_n(Step::reject("still broken"), 20)),
        );
        let mut cfg = config(2, 2);
        cfg.retry_max = 1;
        cfg.pivot_max = 1;
        cfg.research_max = 1;
        let mut rt = fake_runtime(
            temp.path(),
            cfg,
            graph(&[(1, &[]), (2, &[1]), (3, &[2]), (4, &[])]),
            worker.clone(),
            Arc::new(FakeBackend::default()),
        );
        execute(&mut rt).expect("execute");

        assert_eq!(worker.calls_for(1).len(), 3);
        assert!(worker.calls_for(1)[2].research.is_some());
        assert_eq!(rt.state.task(TaskId(1)).expect("t1").status, TaskStatus::Failed);
        for id in [2, 3] {
            let task = rt.state.task(TaskId(id)).expect("task");
            assert_eq!(task.status, TaskStatus::Skipped);
            assert_eq!(task.outcome_note.as_deref(), Some(UNREACHABLE_DEPENDENCY));
        }
        assert_eq!(rt.state.task(TaskId(4)).expect("t4").status, TaskStatus::Done);
        assert_eq!(rt.state.stuck_reports.len(), 1);
        assert_eq!(rt.state.stuck_reports[0].attempts_summary.len(), 3);
    }

    #[test]
    fn resource_failures_abandon_without_retry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::default());
        backend.fail_prepare("foreman/task-1");
        let worker = Arc::new(ScriptedWorker::new());
        let mut rt = fake_runtime(
            temp.path(),
            config(1, 1),
            graph(&[(1, &[])]),
            worker.clone(),
            backend,
        );
        execute(&mut rt).expect("execute");
        assert!(worker.calls().is_empty());
        let task = rt.state.task(TaskId(1)).expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.outcome_note.as_deref().expect("note").contains("resource failure"));
        assert_eq!(rt.state.failures[&TaskId(1)].retry_count, 0);
    }

    #[cfg(unix)]
    #[test]
    fn missing_worker_program_fails_the_task_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut rt = fake_runtime(
            temp.path(),
            config(1, 1),
            graph(&[(1, &[]), (2, &[1])]),
            Arc::new(ScriptedWorker::new()),
            Arc::new(FakeBackend::default()),
        );
        rt.collab.worker = Arc::new(CommandWorker::new(
            vec!["foreman-worker-does-not-exist".to_string()],
            1_000,
        ));

        assert_eq!(execute(&mut rt).expect("execute"), ExecuteStop::Drained);
        let task = rt.state.task(TaskId(1)).expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.outcome_note.as_deref().expect("note").contains("cannot be started"));
        let record = &rt.state.failures[&TaskId(1)];
        assert_eq!(record.attempts.len(), 1);
        assert_eq!(record.attempts[0].kind, FailureKind::Resource);
        assert_eq!(record.level, EscalationLevel::Retry);
        assert_eq!(rt.state.task(TaskId(2)).expect("t2").status, TaskStatus::Skipped);
    }

    #[test]
    fn crash_counts_as_transient_and_timeout_as_logic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(
            ScriptedWorker::new()
                .script(1, [Step::Crash("segfault".to_string())])
                .script(2, [Step::Hang]),
        );
        let mut cfg = config(2, 2);
        cfg.task_timeout_secs = 1;
        let mut rt = fake_runtime(
            temp.path(),
            cfg,
            graph(&[(1, &[]), (2, &[])]),
            worker,
            Arc::new(FakeBackend::default()),
        );
        execute(&mut rt).expect("execute");
        assert_eq!(rt.state.ids_with_status(TaskStatus::Done).len(), 2);
        let failed: Vec<(TaskId, FailureKind, String)> = events(&rt)
            .into_iter()
            .filter_map(|event| match event {
                Event::TaskFailed {
                    task_id,
                    kind,
                    error,
                } => Some((task_id, kind, error)),
                _ => None,
            })
            .collect();
        assert!(failed.contains(&(TaskId(2), FailureKind::Logic, "timeout".to_string())));
        assert!(failed.iter().any(|(id, kind, error)| *id == TaskId(1)
            && *kind == FailureKind::Transient
            && error.contains("segfault")));
    }

    #[test]
    fn handoff_checkpoints_partial_work_and_writes_signal_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(
            ScriptedWorker::new()
                .script(
                    1,
                    [Step::Approve {
                        evidence: "big".to_string(),
                        tokens: 850,
                    }],
                )
                .script(2, [Step::Hang]),
        );
        let mut cfg = config(2, 2);
        cfg.token_budget = 1_000;
        cfg.handoff_grace_secs = 0;
        let mut rt = fake_runtime(
            temp.path(),
            cfg,
            graph(&[(1, &[]), (2, &[]), (3, &[1])]),
            worker,
            Arc::new(FakeBackend::default()),
        );

        let stop = execute(&mut rt).expect("execute");
        let ExecuteStop::Handoff { checkpoint_id } = stop else {
            panic!("expected handoff, got {stop:?}");
        };
        assert_eq!(rt.state.current_phase, Phase::Checkpointed);
        assert_eq!(rt.state.resume_phase, Some(Phase::Execute));
        assert_eq!(rt.state.task(TaskId(1)).expect("t1").status, TaskStatus::Done);
        assert_eq!(rt.state.task(TaskId(2)).expect("t2").status, TaskStatus::Assigned);
        assert_eq!(rt.state.task(TaskId(3)).expect("t3").status, TaskStatus::Pending);

        let checkpoint = rt.checkpoints.load(&checkpoint_id).expect("checkpoint");
        assert_eq!(checkpoint.reason, "handoff");
        assert_eq!(checkpoint.partial_slots().len(), 1);
        let signal = read_handoff(&rt.paths.handoff_path)
            .expect("read")
            .expect("signal");
        assert_eq!(signal.checkpoint_id, checkpoint_id);
        let handoffs = events(&rt)
            .into_iter()
            .filter(|event| matches!(event, Event::HandoffRequested { .. }))
            .count();
        assert_eq!(handoffs, 1);
    }

    #[test]
    fn reconcile_releases_busy_slots_without_charging_partial_ones() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut rt = fake_runtime(
            temp.path(),
            config(2, 2),
            graph(&[(1, &[]), (2, &[])]),
            Arc::new(ScriptedWorker::new()),
            Arc::new(FakeBackend::default()),
        );
        let retry_max = rt.config.retry_max;
        for _ in 1..retry_max {
            apply_failure(&mut rt, TaskId(1), FailureKind::Logic, "tests fail").expect("fail");
        }
        let partial_slot = rt.state.slots.acquire(TaskId(1)).expect("acquire");
        rt.state.slots.acquire(TaskId(2)).expect("acquire");
        for id in [1, 2] {
            rt.state.task_mut(TaskId(id)).expect("task").status = TaskStatus::Assigned;
        }

        reconcile(&mut rt, &BTreeSet::from([partial_slot])).expect("reconcile");
        assert!(
            rt.state
                .slots
                .slots()
                .iter()
                .all(|slot| slot.status == SlotStatus::Idle)
        );
        assert_eq!(rt.state.ids_with_status(TaskStatus::Pending).len(), 2);
        let record = &rt.state.failures[&TaskId(1)];
        assert_eq!(record.level, EscalationLevel::Retry);
        assert_eq!(record.retry_count, retry_max - 1);
        assert_eq!(record.last_error, "tests fail");
        assert!(!rt.state.failures.contains_key(&TaskId(2)));
        assert!(
            rt.state
                .history
                .iter()
                .any(|entry| entry.event == format!("task 1 {INTERRUPTED_BY_HANDOFF}"))
        );
    }

    #[test]
    fn progress_checkpoints_follow_approvals() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(1, 1);
        cfg.checkpoint_every = 2;
        let mut rt = fake_runtime(
            temp.path(),
            cfg,
            graph(&[(1, &[]), (2, &[]), (3, &[]), (4, &[]), (5, &[])]),
            Arc::new(ScriptedWorker::new()),
            Arc::new(FakeBackend::default()),
        );
        execute(&mut rt).expect("execute");
        assert_eq!(rt.state.checkpoint_lineage, vec!["cp-0001", "cp-0002"]);
        let first = rt.checkpoints.load("cp-0001").expect("cp-0001");
        assert_eq!(first.completed_task_ids.len(), 2);
        assert!(fs::read_to_string(&rt.paths.state_path).is_ok());
    }
}
