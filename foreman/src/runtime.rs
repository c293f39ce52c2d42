//! The coordinator's working set: state plus everything that touches it.
//!
//! A [`Runtime`] is owned by exactly one thread. Every mutation of the
//! orchestration state goes through it so persistence, invariant checks
//! and event publication happen in one place.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::events::{Event, EventBus};
use crate::core::invariants::validate_invariants;
use crate::core::state::OrchestrationState;
use crate::core::types::{Phase, SlotId};
use crate::io::checkpoint::{Checkpoint, CheckpointManager};
use crate::io::config::{ForemanConfig, load_config_with_env};
use crate::io::journal::{Journal, TracingSink};
use crate::io::paths::ForemanPaths;
use crate::io::state_store::{load_state, write_state};
use crate::io::strategies::{
    AlternativeFinder, ConflictResolver, ContextGatherer, DeferToOperator, FailureHistoryHints,
    FileContextGatherer, JsonlLearningStore, LearningStore,
};
use crate::io::verify::{CommandVerifier, Verifier};
use crate::io::worker::{CommandWorker, Worker};
use crate::io::workspace::{GitWorktreeBackend, WorkspaceBackend};

/// Bytes of each task file handed to a Research re-dispatch.
const RESEARCH_BYTES_PER_FILE: usize = 4_000;

/// External collaborators behind trait seams.
pub struct Collaborators {
    pub worker: Arc<dyn Worker>,
    pub backend: Arc<dyn WorkspaceBackend>,
    pub alternatives: Box<dyn AlternativeFinder>,
    pub gatherer: Box<dyn ContextGatherer>,
    pub resolver: Box<dyn ConflictResolver>,
    pub verifier: Box<dyn Verifier>,
    pub learnings: Box<dyn LearningStore>,
}

impl Collaborators {
    /// Production wiring: command worker, git worktrees, local strategies.
    pub fn from_config(paths: &ForemanPaths, config: &ForemanConfig) -> Self {
        Self {
            worker: Arc::new(CommandWorker::new(
                config.worker.command.clone(),
                config.output_limit_bytes,
            )),
            backend: Arc::new(GitWorktreeBackend::new(paths.root())),
            alternatives: Box::new(FailureHistoryHints),
            gatherer: Box::new(FileContextGatherer::new(
                paths.root(),
                RESEARCH_BYTES_PER_FILE,
            )),
            resolver: Box::new(DeferToOperator),
            verifier: Box::new(CommandVerifier),
            learnings: Box::new(JsonlLearningStore::new(&paths.learnings_path)),
        }
    }

    /// Same strategies as production around a caller-supplied worker and backend.
    pub fn with_parts(
        paths: &ForemanPaths,
        worker: Arc<dyn Worker>,
        backend: Arc<dyn WorkspaceBackend>,
    ) -> Self {
        Self {
            worker,
            backend,
            alternatives: Box::new(FailureHistoryHints),
            gatherer: Box::new(FileContextGatherer::new(
                paths.root(),
                RESEARCH_BYTES_PER_FILE,
            )),
            resolver: Box::new(DeferToOperator),
            verifier: Box::new(CommandVerifier),
            learnings: Box::new(JsonlLearningStore::new(&paths.learnings_path)),
        }
    }
}

pub struct Runtime {
    pub paths: ForemanPaths,
    pub config: ForemanConfig,
    pub state: OrchestrationState,
    pub collab: Collaborators,
    pub checkpoints: CheckpointManager,
    events: EventBus,
}

impl Runtime {
    pub fn new(
        paths: ForemanPaths,
        config: ForemanConfig,
        state: OrchestrationState,
        collab: Collaborators,
    ) -> Self {
        let checkpoints = CheckpointManager::new(
            &paths.checkpoints_dir,
            &paths.archive_dir,
            config.checkpoint_retention,
        );
        let events = EventBus::new()
            .with_sink(TracingSink)
            .with_sink(Journal::new(&paths.events_path));
        Self {
            paths,
            config,
            state,
            collab,
            checkpoints,
            events,
        }
    }

    /// Load config and state for an initialized project root.
    pub fn open(
        root: &Path,
        collab: impl FnOnce(&ForemanPaths, &ForemanConfig) -> Collaborators,
    ) -> Result<Self> {
        let paths = ForemanPaths::new(root);
        if !paths.is_initialized() {
            return Err(anyhow!(
                "{} is not initialized (run `foreman init` first)",
                root.display()
            ));
        }
        let config = load_config_with_env(&paths.config_path)?;
        let state = load_state(&paths.state_path)?;
        let collab = collab(&paths, &config);
        Ok(Self::new(paths, config, state, collab))
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Write state atomically. Test and debug builds re-check invariants first.
    pub fn persist(&self) -> Result<()> {
        if cfg!(any(test, debug_assertions)) {
            let errors = validate_invariants(&self.state);
            if !errors.is_empty() {
                return Err(anyhow!(
                    "refusing to persist broken state: {}",
                    errors.join("; ")
                ));
            }
        }
        write_state(&self.paths.state_path, &self.state)
    }

    pub fn emit(&mut self, event: Event) -> Result<()> {
        let at = self.now();
        self.events.publish(at, &event).context("publish event")
    }

    /// Guarded phase transition, persisted and published.
    pub fn transition(&mut self, to: Phase) -> Result<()> {
        let from = self.state.current_phase;
        let at = self.now();
        self.state.transition(to, at)?;
        self.persist()?;
        self.emit(Event::PhaseChanged { from, to })
    }

    /// Create a checkpoint of the current state and persist the new lineage.
    pub fn checkpoint(&mut self, reason: &str, partial: &BTreeSet<SlotId>) -> Result<Checkpoint> {
        let at = self.now();
        let checkpoint = self.checkpoints.create(
            &mut self.state,
            reason,
            partial,
            self.collab.backend.as_ref(),
            at,
        )?;
        self.persist()?;
        self.emit(Event::CheckpointCreated {
            checkpoint_id: checkpoint.id.clone(),
            reason: reason.to_string(),
        })?;
        debug!(checkpoint_id = %checkpoint.id, "checkpoint recorded in lineage");
        Ok(checkpoint)
    }
}
