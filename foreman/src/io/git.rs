//! Git adapter for workspaces and integration.
//!
//! Every repository operation foreman performs goes through this small,
//! explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Merged,
    /// Git stopped with conflicts in these files; the merge is still in progress.
    Conflicted(Vec<String>),
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA a ref points to, or `None` if it does not resolve.
    pub fn resolve(&self, reference: &str) -> Result<Option<String>> {
        let spec = format!("{reference}^{{commit}}");
        let output = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    /// Head of a local branch, or `None` if the branch is gone.
    pub fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        if !self.branch_exists(branch)? {
            return Ok(None);
        }
        self.resolve(&format!("refs/heads/{branch}"))
    }

    /// Tree object of HEAD; equal trees mean byte-identical content.
    pub fn head_tree(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD^{tree}"])?.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is fully clean (including untracked files).
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Add a worktree at `path` on `branch`, creating the branch from `base`
    /// when it does not exist yet.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path_arg(path)?;
        if self.branch_exists(branch)? {
            debug!("adding worktree on existing branch");
            self.run_checked(&["worktree", "add", path_str, branch])?;
        } else {
            debug!(base, "adding worktree on new branch");
            self.run_checked(&["worktree", "add", "-b", branch, path_str, base])?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path_arg(path)?;
        self.run_checked(&["worktree", "remove", "--force", path_str])?;
        Ok(())
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Checkout `branch`, creating it from `base` if missing.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_or_create(&self, branch: &str, base: &str) -> Result<()> {
        if self.branch_exists(branch)? {
            debug!("checking out branch");
            self.run_checked(&["checkout", branch])?;
        } else {
            debug!(base, "creating and checking out new branch");
            self.run_checked(&["checkout", "-b", branch, base])?;
        }
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Detach HEAD so the current branch can be checked out elsewhere.
    pub fn checkout_detach(&self) -> Result<()> {
        self.run_checked(&["checkout", "--detach"])?;
        Ok(())
    }

    /// Drop tracked modifications and untracked files.
    #[instrument(skip_all)]
    pub fn discard_changes(&self) -> Result<()> {
        debug!("discarding uncommitted changes");
        self.run_checked(&["reset", "--hard"])?;
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    pub fn merge_base(&self, left: &str, right: &str) -> Result<String> {
        Ok(self
            .run_capture(&["merge-base", left, right])?
            .trim()
            .to_string())
    }

    /// `git diff -U0 base..branch` for overlap analysis.
    pub fn diff_zero_context(&self, base: &str, branch: &str) -> Result<String> {
        self.run_capture(&["diff", "-U0", "--no-color", "--no-renames", base, branch])
    }

    /// `git merge --no-ff`; conflicts are reported, not raised.
    #[instrument(skip_all, fields(branch))]
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<MergeAttempt> {
        let output = self.run(&["merge", "--no-ff", "--no-edit", "-m", message, branch])?;
        if output.status.success() {
            debug!("merge succeeded");
            return Ok(MergeAttempt::Merged);
        }
        let conflicted = self.conflicted_files()?;
        if conflicted.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git merge {branch} failed: {}", stderr.trim()));
        }
        warn!(files = conflicted.len(), "merge stopped on conflicts");
        Ok(MergeAttempt::Conflicted(conflicted))
    }

    pub fn merge_abort(&self) -> Result<()> {
        self.run_checked(&["merge", "--abort"])?;
        Ok(())
    }

    /// True while a merge is in progress (`MERGE_HEAD` exists).
    pub fn merge_in_progress(&self) -> Result<bool> {
        Ok(self.resolve("MERGE_HEAD")?.is_some())
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        Ok(output.status.success())
    }

    fn conflicted_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    /// Paths are printed verbatim, not octal-escaped, so non-ASCII names
    /// read back as written.
    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(["-c", "core.quotePath=false"])
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
