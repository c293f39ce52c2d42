//! `.foreman/handoff.json`: tells the supervising process to start a fresh
//! session from a checkpoint.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::checkpoint::TokenUsage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffSignal {
    pub checkpoint_id: String,
    pub reason: String,
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
}

/// Create the signal file. Fails if one is already present.
pub fn write_handoff(path: &Path, signal: &HandoffSignal) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut json = serde_json::to_string_pretty(signal).context("serialize handoff signal")?;
    json.push('\n');
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(anyhow!(
                "handoff signal {} already exists (resume with `foreman run --resume`)",
                path.display()
            ));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("create {}", path.display()));
        }
    };
    file.write_all(json.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    info!(checkpoint_id = %signal.checkpoint_id, "handoff signal written");
    Ok(())
}

pub fn read_handoff(path: &Path) -> Result<Option<HandoffSignal>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let signal =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(signal))
}

/// Remove the signal once a resume has started. Returns what was consumed.
pub fn consume_handoff(path: &Path) -> Result<Option<HandoffSignal>> {
    let signal = read_handoff(path)?;
    if signal.is_some() {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
        debug!(path = %path.display(), "handoff signal consumed");
    }
    Ok(signal)
}
