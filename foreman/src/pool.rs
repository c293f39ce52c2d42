//! Workspace pool operations behind `foreman init|acquire|release|status|health|cleanup`.
//!
//! Slot bookkeeping lives in [`crate::core::pool::SlotTable`]; these
//! functions pair it with the workspace backend and persist the result.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::events::Event;
use crate::core::pool::SlotTable;
use crate::core::state::OrchestrationState;
use crate::core::types::{Phase, SlotId, SlotInfo, SlotStatus, TaskId, TaskStatus, task_branch};
use crate::error::{UnknownSlot, WorkspaceUnavailable};
use crate::io::atomic::write_atomic;
use crate::io::config::{load_config, write_config};
use crate::io::paths::ForemanPaths;
use crate::io::state_store::{load_state, write_state};
use crate::io::workspace::PrepareRequest;
use crate::runtime::Runtime;

/// Everything under `.foreman/` stays out of the project's history.
const FOREMAN_GITIGNORE: &str = "*\n";

/// Create `.foreman/` with config, state and `size` idle slots.
///
/// Re-running on an initialized root resizes the pool and keeps the rest of
/// the state, but only while every slot is Idle.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn init(root: &Path, size: Option<u32>) -> Result<ForemanPaths> {
    let paths = ForemanPaths::new(root);
    let mut config = load_config(&paths.config_path)?;
    if let Some(size) = size {
        config.pool_size = size;
    }
    config.validate()?;

    let state = if paths.is_initialized() {
        let mut state = load_state(&paths.state_path)?;
        let busy = state.slots.busy_count();
        if busy > 0 {
            return Err(anyhow!(
                "cannot re-initialize the pool while {busy} slot(s) are busy (release them first)"
            ));
        }
        state.slots = SlotTable::init(config.pool_size, &paths.workspaces_dir);
        info!(pool_size = config.pool_size, "pool re-initialized");
        state
    } else {
        info!(pool_size = config.pool_size, "initializing foreman");
        OrchestrationState::new(
            SlotTable::init(config.pool_size, &paths.workspaces_dir),
            config.token_budget(),
        )
    };

    fs::create_dir_all(&paths.workspaces_dir)
        .with_context(|| format!("create {}", paths.workspaces_dir.display()))?;
    write_atomic(&paths.gitignore_path, FOREMAN_GITIGNORE)?;
    write_config(&paths.config_path, &config)?;
    write_state(&paths.state_path, &state)?;
    Ok(paths)
}

/// Claim a slot for a ready task and provision its workspace.
#[instrument(skip_all, fields(task_id = %task_id))]
pub fn acquire(rt: &mut Runtime, task_id: TaskId) -> Result<SlotId> {
    if rt.state.current_phase != Phase::Execute {
        return Err(anyhow!(
            "slots are handed out in {} (phase is {})",
            Phase::Execute,
            rt.state.current_phase
        ));
    }
    let base = rt
        .state
        .target_branch
        .clone()
        .ok_or_else(|| anyhow!("no target branch recorded (run `foreman plan` first)"))?;
    let task = rt.state.task(task_id)?.clone();
    if task.status != TaskStatus::Pending {
        return Err(anyhow!(
            "task {task_id} is {}, only pending tasks can be acquired",
            task.status.as_str()
        ));
    }
    let blocked: Vec<String> = task
        .depends_on
        .iter()
        .filter(|dep| {
            rt.state
                .tasks
                .get(dep)
                .is_none_or(|dep| dep.status != TaskStatus::Done)
        })
        .map(ToString::to_string)
        .collect();
    if !blocked.is_empty() {
        return Err(anyhow!(
            "task {task_id} waits on unfinished dependencies: {}",
            blocked.join(", ")
        ));
    }

    let slot_id = rt.state.slots.acquire(task_id)?;
    let path = slot_path(&rt.state, slot_id)?;
    let request = PrepareRequest {
        branch: task.branch_name(),
        base,
        inputs: task.depends_on.iter().map(|dep| task_branch(*dep)).collect(),
    };
    if let Err(err) = rt.collab.backend.prepare(&path, &request) {
        rt.state.slots.release(slot_id)?;
        return Err(WorkspaceUnavailable {
            slot_id,
            reason: format!("{err:#}"),
        }
        .into());
    }

    rt.state.task_mut(task_id)?.status = TaskStatus::Assigned;
    let at = rt.now();
    rt.state
        .record(at, format!("slot {slot_id} acquired for task {task_id}"));
    rt.persist()?;
    rt.emit(Event::TaskAssigned {
        task_id,
        slot_id,
        attempt: 1,
        level: None,
    })?;
    Ok(slot_id)
}

/// Return a slot to the pool.
///
/// With `keep_changes` the workspace is committed to the task branch and the
/// task counts as Done; otherwise uncommitted work is discarded and the task
/// goes back to Pending.
#[instrument(skip_all, fields(slot_id = %slot_id, keep_changes))]
pub fn release(rt: &mut Runtime, slot_id: SlotId, keep_changes: bool) -> Result<Option<TaskId>> {
    let slot = rt.state.slots.get(slot_id).ok_or(UnknownSlot(slot_id))?;
    let (path, held) = (slot.path.clone(), slot.assigned_task);
    let Some(task_id) = held else {
        info!("slot already idle");
        return Ok(None);
    };

    let backend = Arc::clone(&rt.collab.backend);
    if keep_changes {
        let committed = backend
            .commit(&path, &format!("foreman: task {task_id}"))
            .with_context(|| format!("commit work in slot {slot_id}"))?;
        info!(task_id = %task_id, committed, "kept workspace changes");
    }
    if let Err(err) = backend.reset(&path) {
        warn!(err = %format!("{err:#}"), "could not reset workspace");
    }

    rt.state.slots.release(slot_id)?;
    let task = rt.state.task_mut(task_id)?;
    if keep_changes {
        task.status = TaskStatus::Done;
        task.outcome_note = Some(format!("released from slot {slot_id} with changes kept"));
    } else {
        task.status = TaskStatus::Pending;
    }
    let at = rt.now();
    rt.state.record(at, format!("slot {slot_id} released"));
    rt.persist()?;
    rt.emit(Event::SlotReleased { slot_id, task_id })?;
    if keep_changes {
        rt.emit(Event::TaskDone {
            task_id,
            evidence: format!("released from slot {slot_id} with changes kept"),
        })?;
    }
    Ok(Some(task_id))
}

pub fn status(rt: &Runtime) -> Vec<SlotInfo> {
    rt.state.slots.status()
}

/// Check that every Busy slot's workspace exists and is on its task branch.
///
/// All problems are reported in one error.
pub fn health(rt: &Runtime) -> Result<usize> {
    let mut problems = Vec::new();
    let mut checked = 0;
    for slot in rt.state.slots.slots() {
        if slot.status != SlotStatus::Busy {
            continue;
        }
        checked += 1;
        let Some(branch) = slot.branch.as_deref() else {
            problems.push(format!("slot {}: busy without a branch", slot.id));
            continue;
        };
        if let Err(err) = rt.collab.backend.verify(&slot.path, branch) {
            problems.push(format!("slot {}: {err:#}", slot.id));
        }
    }
    if problems.is_empty() {
        Ok(checked)
    } else {
        Err(anyhow!(
            "{} unhealthy slot(s):\n  {}",
            problems.len(),
            problems.join("\n  ")
        ))
    }
}

/// Remove every slot workspace. Busy slots block this unless `force`, in
/// which case their tasks return to Pending.
#[instrument(skip_all, fields(force))]
pub fn cleanup(rt: &mut Runtime, force: bool) -> Result<usize> {
    let busy = rt.state.slots.busy_count();
    if busy > 0 && !force {
        return Err(anyhow!(
            "{busy} slot(s) are busy; release them or pass --force"
        ));
    }
    let slots: Vec<(SlotId, Option<TaskId>, PathBuf)> = rt
        .state
        .slots
        .slots()
        .iter()
        .map(|slot| (slot.id, slot.assigned_task, slot.path.clone()))
        .collect();
    let mut removed = 0;
    for (slot_id, held, path) in slots {
        if let Some(task_id) = held {
            warn!(slot_id = %slot_id, task_id = %task_id, "force-releasing busy slot");
            rt.state.slots.release(slot_id)?;
            rt.state.task_mut(task_id)?.status = TaskStatus::Pending;
            rt.emit(Event::SlotReleased { slot_id, task_id })?;
        }
        if path.exists() {
            removed += 1;
        }
        rt.collab
            .backend
            .remove(&path)
            .with_context(|| format!("remove workspace of slot {slot_id}"))?;
    }
    let at = rt.now();
    rt.state.record(at, format!("cleanup removed {removed} workspace(s)"));
    rt.persist()?;
    info!(removed, "workspaces cleaned up");
    Ok(removed)
}

fn slot_path(state: &OrchestrationState, slot_id: SlotId) -> Result<PathBuf> {
    state
        .slots
        .get(slot_id)
        .map(|slot| slot.path.clone())
        .ok_or_else(|| UnknownSlot(slot_id).into())
}
