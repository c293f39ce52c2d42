//! Checkpoint creation, retention and consistency-checked restore.
//!
//! Checkpoints live at `.foreman/checkpoints/cp-<seq>.json`. Each embeds the
//! full state, so a restore is lossless; slot snapshots add the branch heads
//! that must still match before a resume is allowed.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::atomic::write_json_atomic;
use super::state_store::check_loaded;
use super::workspace::WorkspaceBackend;
use crate::core::state::OrchestrationState;
use crate::core::types::{Phase, SlotId, SlotStatus, TaskId, TaskStatus};
use crate::error::{BranchMismatch, CheckpointInconsistent};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub slot_id: SlotId,
    pub status: SlotStatus,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Branch head at checkpoint time; `None` if the branch did not exist yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Work was cut off by a handoff and must be redone.
    #[serde(default)]
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub used: u64,
    pub max: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub id: String,
    pub seq: u32,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    /// Phase the session was in (the phase a resume re-enters).
    pub phase: Phase,
    pub completed_task_ids: Vec<TaskId>,
    pub pending_task_ids: Vec<TaskId>,
    pub assigned_task_ids: Vec<TaskId>,
    pub failed_task_ids: Vec<TaskId>,
    pub skipped_task_ids: Vec<TaskId>,
    pub slot_snapshots: Vec<SlotSnapshot>,
    pub token_usage: TokenUsage,
    pub resume_hint: String,
    pub state: OrchestrationState,
}

impl Checkpoint {
    pub fn partial_slots(&self) -> BTreeSet<SlotId> {
        self.slot_snapshots
            .iter()
            .filter(|snapshot| snapshot.partial)
            .map(|snapshot| snapshot.slot_id)
            .collect()
    }
}

/// Listing entry for `foreman checkpoints`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub seq: u32,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub phase: Phase,
    pub completed: usize,
    pub pending: usize,
}

pub fn checkpoint_id(seq: u32) -> String {
    format!("cp-{seq:04}")
}

fn parse_seq(id: &str) -> Option<u32> {
    id.strip_prefix("cp-")?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    archive_dir: PathBuf,
    retention: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            archive_dir: archive_dir.into(),
            retention,
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Snapshot `state` as a new immutable checkpoint.
    ///
    /// Appends the new id to `state.checkpoint_lineage` before snapshotting,
    /// so the caller should persist `state` afterwards.
    #[instrument(skip_all, fields(reason))]
    pub fn create(
        &self,
        state: &mut OrchestrationState,
        reason: &str,
        partial: &BTreeSet<SlotId>,
        backend: &dyn WorkspaceBackend,
        at: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let seq = self.next_seq()?;
        let id = checkpoint_id(seq);
        state.checkpoint_lineage.push(id.clone());

        let mut slot_snapshots = Vec::with_capacity(state.slots.len());
        for slot in state.slots.slots() {
            let head = match &slot.branch {
                Some(branch) => backend
                    .branch_head(branch)
                    .with_context(|| format!("read head of {branch}"))?,
                None => None,
            };
            slot_snapshots.push(SlotSnapshot {
                slot_id: slot.id,
                status: slot.status,
                path: slot.path.clone(),
                branch: slot.branch.clone(),
                head,
                task_id: slot.assigned_task,
                partial: partial.contains(&slot.id),
            });
        }

        let phase = match state.current_phase {
            Phase::Checkpointed => state.resume_phase.unwrap_or(Phase::Checkpointed),
            phase => phase,
        };
        let completed_task_ids = state.ids_with_status(TaskStatus::Done);
        let pending_task_ids = state.ids_with_status(TaskStatus::Pending);
        let assigned_task_ids = state.ids_with_status(TaskStatus::Assigned);
        let resume_hint = format!(
            "resume {phase}: {} done, {} pending, {} assigned, {} partial slot(s)",
            completed_task_ids.len(),
            pending_task_ids.len(),
            assigned_task_ids.len(),
            partial.len()
        );

        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            id: id.clone(),
            seq,
            created_at: at,
            reason: reason.to_string(),
            phase,
            completed_task_ids,
            pending_task_ids,
            assigned_task_ids,
            failed_task_ids: state.ids_with_status(TaskStatus::Failed),
            skipped_task_ids: state.ids_with_status(TaskStatus::Skipped),
            slot_snapshots,
            token_usage: TokenUsage {
                used: state.token_budget.used,
                max: state.token_budget.max,
            },
            resume_hint,
            state: state.clone(),
        };

        let path = self.path_for(&id);
        if path.exists() {
            return Err(anyhow!("checkpoint {id} already exists"));
        }
        write_json_atomic(&path, &checkpoint)?;
        info!(checkpoint_id = %id, phase = %phase, "checkpoint created");
        self.enforce_retention()?;
        Ok(checkpoint)
    }

    /// Load a checkpoint by id from the live directory or the archive.
    pub fn load(&self, id: &str) -> Result<Checkpoint> {
        let live = self.path_for(id);
        let path = if live.exists() {
            live
        } else {
            let archived = self.archive_dir.join(format!("{id}.json"));
            if !archived.exists() {
                return Err(anyhow!("unknown checkpoint {id}"));
            }
            archived
        };
        read_checkpoint(&path)
    }

    /// Newest live checkpoint, if any.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        match self.live_ids()?.last() {
            Some((_, id)) => self.load(id).map(Some),
            None => Ok(None),
        }
    }

    /// Live checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>> {
        self.live_ids()?
            .into_iter()
            .map(|(_, id)| {
                let checkpoint = self.load(&id)?;
                Ok(CheckpointSummary {
                    id: checkpoint.id,
                    seq: checkpoint.seq,
                    created_at: checkpoint.created_at,
                    reason: checkpoint.reason,
                    phase: checkpoint.phase,
                    completed: checkpoint.completed_task_ids.len(),
                    pending: checkpoint.pending_task_ids.len(),
                })
            })
            .collect()
    }

    /// Load `id` and return its state after the repository consistency check.
    ///
    /// Every recorded branch head must still exist and match; otherwise the
    /// restore fails with [`CheckpointInconsistent`] listing each mismatch.
    #[instrument(skip_all, fields(checkpoint_id = id))]
    pub fn restore(&self, id: &str, backend: &dyn WorkspaceBackend) -> Result<Checkpoint> {
        let checkpoint = self.load(id)?;
        let mut mismatches = Vec::new();
        for snapshot in &checkpoint.slot_snapshots {
            let (Some(branch), Some(expected)) = (&snapshot.branch, &snapshot.head) else {
                continue;
            };
            let actual = backend
                .branch_head(branch)
                .with_context(|| format!("read head of {branch}"))?;
            if actual.as_deref() != Some(expected.as_str()) {
                warn!(branch = %branch, expected = %expected, actual = ?actual, "branch moved since checkpoint");
                mismatches.push(BranchMismatch {
                    slot_id: snapshot.slot_id,
                    branch: branch.clone(),
                    expected_head: Some(expected.clone()),
                    actual_head: actual,
                });
            }
        }
        if !mismatches.is_empty() {
            return Err(CheckpointInconsistent {
                checkpoint_id: checkpoint.id,
                mismatches,
            }
            .into());
        }
        check_loaded(&checkpoint.state)
            .with_context(|| format!("validate state in checkpoint {}", checkpoint.id))?;
        debug!(phase = %checkpoint.phase, "checkpoint restored");
        Ok(checkpoint)
    }

    fn next_seq(&self) -> Result<u32> {
        let mut max = 0;
        for dir in [&self.dir, &self.archive_dir] {
            for (seq, _) in ids_in(dir)? {
                max = max.max(seq);
            }
        }
        Ok(max + 1)
    }

    fn live_ids(&self) -> Result<Vec<(u32, String)>> {
        ids_in(&self.dir)
    }

    /// Move all but the newest `retention` checkpoints into the archive.
    fn enforce_retention(&self) -> Result<()> {
        let ids = self.live_ids()?;
        if ids.len() <= self.retention {
            return Ok(());
        }
        fs::create_dir_all(&self.archive_dir)
            .with_context(|| format!("create directory {}", self.archive_dir.display()))?;
        let excess = ids.len() - self.retention;
        for (_, id) in ids.into_iter().take(excess) {
            let from = self.path_for(&id);
            let to = self.archive_dir.join(format!("{id}.json"));
            fs::rename(&from, &to)
                .with_context(|| format!("archive {} to {}", from.display(), to.display()))?;
            debug!(checkpoint_id = %id, "checkpoint archived");
        }
        Ok(())
    }
}

/// `(seq, id)` pairs of checkpoint files in `dir`, sorted by seq.
fn ids_in(dir: &Path) -> Result<Vec<(u32, String)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Some(seq) = parse_seq(stem) {
            ids.push((seq, stem.to_string()));
        }
    }
    ids.sort();
    Ok(ids)
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let checkpoint: Checkpoint = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(anyhow!(
            "unsupported checkpoint version {} in {}",
            checkpoint.version,
            path.display()
        ));
    }
    Ok(checkpoint)
}
