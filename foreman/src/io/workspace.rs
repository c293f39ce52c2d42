//! Workspace provisioning behind the slot table.
//!
//! Slots map to git worktrees under `.foreman/workspaces/slot-<n>`. The
//! backend is a trait so scheduler tests can run without a repository.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use super::git::{Git, MergeAttempt};

/// What a slot must look like before a worker starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub branch: String,
    /// Branch new task branches fork from.
    pub base: String,
    /// Branches of Done dependencies, merged in when the task branch is new.
    pub inputs: Vec<String>,
}

/// Filesystem and VCS side of the pool.
pub trait WorkspaceBackend: Send + Sync {
    /// Make `path` a clean checkout of the task branch.
    fn prepare(&self, path: &Path, request: &PrepareRequest) -> Result<()>;

    /// Commit approved work on the current branch. Returns false if nothing changed.
    fn commit(&self, path: &Path, message: &str) -> Result<bool>;

    /// Drop uncommitted state and detach the workspace from its branch.
    fn reset(&self, path: &Path) -> Result<()>;

    /// Head commit of `branch`, or `None` if it does not exist.
    fn branch_head(&self, branch: &str) -> Result<Option<String>>;

    /// Check that `path` exists and has `branch` checked out.
    fn verify(&self, path: &Path, branch: &str) -> Result<()>;

    /// Remove the workspace at `path` entirely.
    fn remove(&self, path: &Path) -> Result<()>;
}

/// Git worktree implementation rooted at the project repository.
#[derive(Debug, Clone)]
pub struct GitWorktreeBackend {
    git: Git,
}

impl GitWorktreeBackend {
    pub fn new(root: &Path) -> Self {
        Self { git: Git::new(root) }
    }

    fn merge_inputs(&self, path: &Path, request: &PrepareRequest) -> Result<()> {
        let wt = Git::new(path);
        for input in &request.inputs {
            let message = format!("foreman: bring {input} into {}", request.branch);
            match wt.merge_no_ff(input, &message)? {
                MergeAttempt::Merged => debug!(input, "merged dependency branch"),
                MergeAttempt::Conflicted(files) => {
                    wt.merge_abort()?;
                    return Err(anyhow!(
                        "dependency branches conflict in {}: {}",
                        request.branch,
                        files.join(", ")
                    ));
                }
            }
        }
        Ok(())
    }
}

impl WorkspaceBackend for GitWorktreeBackend {
    #[instrument(skip_all, fields(path = %path.display(), branch = %request.branch))]
    fn prepare(&self, path: &Path, request: &PrepareRequest) -> Result<()> {
        let fresh_branch = !self.git.branch_exists(&request.branch)?;
        if path.join(".git").exists() {
            debug!("reusing worktree");
            let wt = Git::new(path);
            wt.discard_changes()?;
            wt.checkout_or_create(&request.branch, &request.base)?;
            wt.discard_changes()?;
        } else {
            if path.exists() {
                warn!("removing stale workspace directory");
                fs::remove_dir_all(path)
                    .with_context(|| format!("remove stale workspace {}", path.display()))?;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            self.git.worktree_prune()?;
            self.git.worktree_add(path, &request.branch, &request.base)?;
        }
        if fresh_branch {
            self.merge_inputs(path, request)?;
        }
        info!("workspace ready");
        Ok(())
    }

    fn commit(&self, path: &Path, message: &str) -> Result<bool> {
        let wt = Git::new(path);
        wt.add_all()?;
        wt.commit_staged(message)
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn reset(&self, path: &Path) -> Result<()> {
        if !path.join(".git").exists() {
            debug!("no worktree to reset");
            return Ok(());
        }
        let wt = Git::new(path);
        wt.discard_changes()?;
        wt.checkout_detach()?;
        Ok(())
    }

    fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        self.git.branch_head(branch)
    }

    fn verify(&self, path: &Path, branch: &str) -> Result<()> {
        if !path.exists() {
            return Err(anyhow!("workspace {} is missing", path.display()));
        }
        let current = Git::new(path)
            .current_branch()
            .with_context(|| format!("read branch of {}", path.display()))?;
        if current != branch {
            return Err(anyhow!(
                "workspace {} is on {current}, expected {branch}",
                path.display()
            ));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn remove(&self, path: &Path) -> Result<()> {
        if path.join(".git").exists() {
            self.git.worktree_remove(path)?;
        } else if path.exists() {
            fs::remove_dir_all(path)
                .with_context(|| format!("remove workspace {}", path.display()))?;
        }
        self.git.worktree_prune()
    }
}
