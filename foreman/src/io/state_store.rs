//! Durable orchestration state (`.foreman/state.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::atomic::write_json_atomic;
use crate::core::invariants::validate_invariants;
use crate::core::state::{OrchestrationState, STATE_VERSION};

/// Load state from disk, rejecting unknown versions and broken invariants.
pub fn load_state(path: &Path) -> Result<OrchestrationState> {
    debug!(path = %path.display(), "loading state");
    if !path.exists() {
        return Err(anyhow!(
            "no foreman state at {} (run `foreman init` first)",
            path.display()
        ));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let state: OrchestrationState =
        serde_json::from_str(&contents).with_context(|| format!("parse state {}", path.display()))?;
    check_loaded(&state).with_context(|| format!("validate state {}", path.display()))?;
    debug!(
        phase = %state.current_phase,
        tasks = state.tasks.len(),
        session = state.session,
        "state loaded"
    );
    Ok(state)
}

/// Version and invariant checks shared by state and checkpoint loading.
pub fn check_loaded(state: &OrchestrationState) -> Result<()> {
    if state.version != STATE_VERSION {
        return Err(anyhow!(
            "unsupported state version {} (expected {STATE_VERSION})",
            state.version
        ));
    }
    let errors = validate_invariants(state);
    if !errors.is_empty() {
        return Err(anyhow!("state invariants failed: {}", errors.join("; ")));
    }
    Ok(())
}

/// Atomically write state to disk (temp file + rename).
pub fn write_state(path: &Path, state: &OrchestrationState) -> Result<()> {
    debug!(
        path = %path.display(),
        phase = %state.current_phase,
        busy = state.slots.busy_count(),
        "writing state"
    );
    write_json_atomic(path, state)
}
