//! Canonical paths within `.foreman/` for a project root.

use std::path::{Path, PathBuf};

use crate::core::types::TaskId;

#[derive(Debug, Clone)]
pub struct ForemanPaths {
    pub root: PathBuf,
    pub foreman_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub handoff_path: PathBuf,
    pub events_path: PathBuf,
    pub learnings_path: PathBuf,
    pub logs_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl ForemanPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let foreman_dir = root.join(".foreman");
        let checkpoints_dir = foreman_dir.join("checkpoints");
        Self {
            root: root.clone(),
            foreman_dir: foreman_dir.clone(),
            config_path: foreman_dir.join("config.toml"),
            state_path: foreman_dir.join("state.json"),
            archive_dir: checkpoints_dir.join("archive"),
            checkpoints_dir,
            handoff_path: foreman_dir.join("handoff.json"),
            events_path: foreman_dir.join("events.jsonl"),
            learnings_path: foreman_dir.join("learnings.jsonl"),
            logs_dir: foreman_dir.join("logs"),
            workspaces_dir: foreman_dir.join("workspaces"),
            gitignore_path: foreman_dir.join(".gitignore"),
        }
    }

    pub fn checkpoint_path(&self, id: &str) -> PathBuf {
        self.checkpoints_dir.join(format!("{id}.json"))
    }

    /// `.foreman/logs/task-<id>/attempt-<n>.log`
    pub fn attempt_log_path(&self, task: TaskId, attempt: u32) -> PathBuf {
        self.logs_dir
            .join(format!("task-{task}"))
            .join(format!("attempt-{attempt}.log"))
    }

    /// Where a worker writes its JSON result for one attempt.
    pub fn attempt_output_path(&self, task: TaskId, attempt: u32) -> PathBuf {
        self.logs_dir
            .join(format!("task-{task}"))
            .join(format!("attempt-{attempt}.output.json"))
    }

    pub fn is_initialized(&self) -> bool {
        self.state_path.exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
