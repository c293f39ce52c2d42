//! Orchestrator configuration stored under `.foreman/config.toml`.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::write_atomic;
use crate::core::budget::TokenBudget;
use crate::core::escalation::EscalationLimits;

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults. The scheduling and
/// budget fields can be overridden with `FOREMAN_<FIELD>` environment
/// variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForemanConfig {
    /// Number of workspace slots.
    pub pool_size: u32,
    /// Maximum concurrently Busy slots.
    pub max_agents: u32,
    pub retry_max: u32,
    pub pivot_max: u32,
    pub research_max: u32,
    /// Token budget per session.
    pub token_budget: u64,
    /// Fraction of `token_budget` that triggers a compression hint.
    pub warn_threshold: f64,
    /// Fraction of `token_budget` that triggers checkpoint + handoff.
    pub handoff_threshold: f64,
    /// Wall-clock limit for one worker attempt.
    pub task_timeout_secs: u64,
    /// How long in-flight workers may finish after a handoff request.
    pub handoff_grace_secs: u64,
    /// Checkpoints kept before older ones move to `checkpoints/archive/`.
    pub checkpoint_retention: usize,
    /// Take a progress checkpoint every N approved tasks (0 disables).
    pub checkpoint_every: u32,
    /// Integration target; defaults to the branch checked out in the root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
    /// Truncate worker and verifier logs beyond this many bytes.
    pub output_limit_bytes: usize,
    pub worker: WorkerConfig,
    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Command run inside the workspace for each attempt.
    pub command: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["foreman-worker".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Limit for each task's verification command during REVIEW.
    pub timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10 * 60,
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        let limits = EscalationLimits::default();
        Self {
            pool_size: 4,
            max_agents: 4,
            retry_max: limits.retry_max,
            pivot_max: limits.pivot_max,
            research_max: limits.research_max,
            token_budget: 200_000,
            warn_threshold: 0.70,
            handoff_threshold: 0.80,
            task_timeout_secs: 30 * 60,
            handoff_grace_secs: 60,
            checkpoint_retention: 10,
            checkpoint_every: 5,
            target_branch: None,
            output_limit_bytes: 100_000,
            worker: WorkerConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(anyhow!("pool_size must be > 0"));
        }
        if self.max_agents == 0 {
            return Err(anyhow!("max_agents must be > 0"));
        }
        if self.retry_max == 0 {
            return Err(anyhow!("retry_max must be > 0"));
        }
        if self.token_budget == 0 {
            return Err(anyhow!("token_budget must be > 0"));
        }
        if !(self.warn_threshold > 0.0 && self.warn_threshold <= 1.0) {
            return Err(anyhow!("warn_threshold must be in (0, 1]"));
        }
        if !(self.handoff_threshold > 0.0 && self.handoff_threshold <= 1.0) {
            return Err(anyhow!("handoff_threshold must be in (0, 1]"));
        }
        if self.warn_threshold > self.handoff_threshold {
            return Err(anyhow!("warn_threshold must not exceed handoff_threshold"));
        }
        if self.task_timeout_secs == 0 {
            return Err(anyhow!("task_timeout_secs must be > 0"));
        }
        if self.checkpoint_retention == 0 {
            return Err(anyhow!("checkpoint_retention must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self
            .target_branch
            .as_deref()
            .is_some_and(|branch| branch.trim().is_empty())
        {
            return Err(anyhow!("target_branch must not be empty when set"));
        }
        Ok(())
    }

    pub fn escalation_limits(&self) -> EscalationLimits {
        EscalationLimits {
            retry_max: self.retry_max,
            pivot_max: self.pivot_max,
            research_max: self.research_max,
        }
    }

    pub fn token_budget(&self) -> TokenBudget {
        TokenBudget::new(
            self.token_budget,
            self.warn_threshold,
            self.handoff_threshold,
        )
    }
}

/// Apply `FOREMAN_<FIELD>` overrides using `lookup` (usually `std::env::var`).
pub fn apply_env_overrides(
    cfg: &mut ForemanConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    fn parse<T: FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
        slot: &mut T,
    ) -> Result<()>
    where
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = lookup(key) {
            *slot = raw
                .trim()
                .parse()
                .map_err(|err| anyhow!("{key}={raw:?}: {err}"))?;
            debug!(key, value = %raw.trim(), "config override from environment");
        }
        Ok(())
    }

    parse(&lookup, "FOREMAN_POOL_SIZE", &mut cfg.pool_size)?;
    parse(&lookup, "FOREMAN_MAX_AGENTS", &mut cfg.max_agents)?;
    parse(&lookup, "FOREMAN_RETRY_MAX", &mut cfg.retry_max)?;
    parse(&lookup, "FOREMAN_PIVOT_MAX", &mut cfg.pivot_max)?;
    parse(&lookup, "FOREMAN_RESEARCH_MAX", &mut cfg.research_max)?;
    parse(&lookup, "FOREMAN_TOKEN_BUDGET", &mut cfg.token_budget)?;
    parse(&lookup, "FOREMAN_WARN_THRESHOLD", &mut cfg.warn_threshold)?;
    parse(&lookup, "FOREMAN_HANDOFF_THRESHOLD", &mut cfg.handoff_threshold)?;
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    let cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        ForemanConfig::default()
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Load config and layer environment overrides on top.
pub fn load_config_with_env(path: &Path) -> Result<ForemanConfig> {
    let mut cfg = load_config(path)?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    cfg.validate().context("config after environment overrides")?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
