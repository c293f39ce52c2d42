//! Test doubles: scripted workers, an in-memory workspace backend and
//! throwaway git repositories.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::graph::{GraphSpec, TaskSpec, build_tasks};
use crate::core::pool::SlotTable;
use crate::core::state::OrchestrationState;
use crate::core::types::{AttemptContext, Phase, Task, TaskId, WorkerOutcome};
use crate::error::{FailureKind, WorkerCancelled};
use crate::io::config::ForemanConfig;
use crate::io::git::Git;
use crate::io::paths::ForemanPaths;
use crate::io::workspace::{PrepareRequest, WorkspaceBackend};
use crate::io::worker::{Worker, WorkerRequest};
use crate::runtime::{Collaborators, Runtime};

/// Build validated tasks from `(id, depends_on)` pairs.
pub fn graph(edges: &[(u32, &[u32])]) -> BTreeMap<TaskId, Task> {
    let spec = GraphSpec {
        tasks: edges
            .iter()
            .map(|(id, deps)| TaskSpec {
                id: *id,
                description: format!("task {id}"),
                files: Vec::new(),
                depends_on: deps.to_vec(),
                verification_command: None,
            })
            .collect(),
    };
    build_tasks(&spec).expect("valid graph")
}

/// Runtime in EXECUTE over `tasks`, rooted at `root`, with fake collaborators.
pub fn fake_runtime(
    root: &Path,
    config: ForemanConfig,
    tasks: BTreeMap<TaskId, Task>,
    worker: Arc<ScriptedWorker>,
    backend: Arc<FakeBackend>,
) -> Runtime {
    let paths = ForemanPaths::new(root);
    let mut state = OrchestrationState::new(
        SlotTable::init(config.pool_size, &paths.workspaces_dir),
        config.token_budget(),
    );
    state.tasks = tasks;
    state.current_phase = Phase::Execute;
    state.target_branch = Some("main".to_string());
    let collab = Collaborators::with_parts(&paths, worker, backend);
    Runtime::new(paths, config, state, collab)
}

/// One scripted worker response.
#[derive(Debug, Clone)]
pub enum Step {
    Approve { evidence: String, tokens: u64 },
    Reject { reason: String, kind: FailureKind },
    /// Return an error, as if the worker process crashed.
    Crash(String),
    /// Block until cancelled.
    Hang,
    /// Sleep, then approve.
    SlowApprove { delay: Duration, tokens: u64 },
    /// Write `contents` to `file` inside the workspace, then approve.
    WriteFile {
        file: String,
        contents: String,
        tokens: u64,
    },
    /// Sleep, then play `step`.
    Delayed { delay: Duration, step: Box<Step> },
}

impl Step {
    pub fn approve(evidence: &str) -> Self {
        Step::Approve {
            evidence: evidence.to_string(),
            tokens: 0,
        }
    }

    pub fn reject(reason: &str) -> Self {
        Step::Reject {
            reason: reason.to_string(),
            kind: FailureKind::Logic,
        }
    }

    pub fn write_file(file: &str, contents: &str) -> Self {
        Step::WriteFile {
            file: file.to_string(),
            contents: contents.to_string(),
            tokens: 0,
        }
    }

    pub fn after(self, delay: Duration) -> Self {
        Step::Delayed {
            delay,
            step: Box::new(self),
        }
    }
}

/// Worker that replays per-task scripts. Tasks without a remaining script
/// step are approved.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    scripts: Mutex<BTreeMap<TaskId, VecDeque<Step>>>,
    calls: Mutex<Vec<(TaskId, AttemptContext)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task: u32, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(TaskId(task))
            .or_default()
            .extend(steps);
        self
    }

    /// Every dispatch in arrival order.
    pub fn calls(&self) -> Vec<(TaskId, AttemptContext)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_for(&self, task: u32) -> Vec<AttemptContext> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| *id == TaskId(task))
            .map(|(_, attempt)| attempt)
            .collect()
    }

    /// Highest number of attempts observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, task: TaskId) -> Option<Step> {
        self.scripts
            .lock()
            .expect("scripts lock")
            .get_mut(&task)
            .and_then(VecDeque::pop_front)
    }

    fn play(&self, step: Option<Step>, request: &WorkerRequest) -> Result<WorkerOutcome> {
        let approved = |evidence: String, tokens_used: u64| WorkerOutcome::Approved {
            evidence,
            tokens_used,
        };
        match step {
            None => Ok(approved("ok".to_string(), 0)),
            Some(Step::Approve { evidence, tokens }) => Ok(approved(evidence, tokens)),
            Some(Step::Reject { reason, kind }) => Ok(WorkerOutcome::Rejected {
                reason,
                kind,
                tokens_used: 0,
            }),
            Some(Step::Crash(message)) => Err(anyhow!(message)),
            Some(Step::Hang) => {
                while !request.cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(WorkerCancelled.into())
            }
            Some(Step::SlowApprove { delay, tokens }) => {
                thread::sleep(delay);
                Ok(approved("slow but done".to_string(), tokens))
            }
            Some(Step::WriteFile {
                file,
                contents,
                tokens,
            }) => {
                let path = request.workspace.join(&file);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, contents)?;
                Ok(approved(format!("wrote {file}"), tokens))
            }
            Some(Step::Delayed { delay, step }) => {
                thread::sleep(delay);
                self.play(Some(*step), request)
            }
        }
    }
}

impl Worker for ScriptedWorker {
    fn run(&self, request: &WorkerRequest) -> Result<WorkerOutcome> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((request.task.id, request.attempt.clone()));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.play(self.next_step(request.task.id), request);
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Debug, Default)]
struct FakeRepo {
    heads: BTreeMap<String, String>,
    checked_out: BTreeMap<PathBuf, String>,
    commits: usize,
    fail_prepare: BTreeSet<String>,
}

/// In-memory [`WorkspaceBackend`]: branches are names mapped to fake heads.
#[derive(Debug, Default)]
pub struct FakeBackend {
    repo: Mutex<FakeRepo>,
}

impl FakeBackend {
    pub fn set_head(&self, branch: &str, head: &str) {
        self.lock()
            .heads
            .insert(branch.to_string(), head.to_string());
    }

    pub fn delete_branch(&self, branch: &str) {
        self.lock().heads.remove(branch);
    }

    pub fn head(&self, branch: &str) -> Option<String> {
        self.lock().heads.get(branch).cloned()
    }

    /// Make `prepare` fail for `branch`.
    pub fn fail_prepare(&self, branch: &str) {
        self.lock().fail_prepare.insert(branch.to_string());
    }

    pub fn checked_out(&self) -> BTreeMap<PathBuf, String> {
        self.lock().checked_out.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeRepo> {
        self.repo.lock().expect("fake repo lock")
    }
}

impl WorkspaceBackend for FakeBackend {
    fn prepare(&self, path: &Path, request: &PrepareRequest) -> Result<()> {
        let mut repo = self.lock();
        if repo.fail_prepare.contains(&request.branch) {
            return Err(anyhow!("cannot provision {}", request.branch));
        }
        fs::create_dir_all(path)?;
        repo.heads
            .entry(request.branch.clone())
            .or_insert_with(|| format!("{}@0", request.branch));
        repo.checked_out
            .insert(path.to_path_buf(), request.branch.clone());
        Ok(())
    }

    fn commit(&self, path: &Path, _message: &str) -> Result<bool> {
        let mut repo = self.lock();
        let branch = repo
            .checked_out
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("nothing checked out at {}", path.display()))?;
        repo.commits += 1;
        let head = format!("{branch}@{}", repo.commits);
        repo.heads.insert(branch, head);
        Ok(true)
    }

    fn reset(&self, path: &Path) -> Result<()> {
        self.lock().checked_out.remove(path);
        Ok(())
    }

    fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        Ok(self.lock().heads.get(branch).cloned())
    }

    fn verify(&self, path: &Path, branch: &str) -> Result<()> {
        if !path.exists() {
            return Err(anyhow!("workspace {} is missing", path.display()));
        }
        match self.lock().checked_out.get(path) {
            Some(current) if current == branch => Ok(()),
            other => Err(anyhow!(
                "workspace {} is on {:?}, expected {branch}",
                path.display(),
                other
            )),
        }
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.lock().checked_out.remove(path);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

/// Temporary git repository on `main` with one commit. `.foreman/` is ignored.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = Self { temp };
        for args in [
            &["init", "-q", "-b", "main"][..],
            &["config", "user.email", "foreman@example.com"],
            &["config", "user.name", "Foreman"],
            &["config", "commit.gpgsign", "false"],
        ] {
            repo.run_git(args);
        }
        fs::write(repo.path().join(".gitignore"), ".foreman/\n").expect("write gitignore");
        fs::write(repo.path().join("README.md"), "test repo\n").expect("write readme");
        let git = repo.git();
        git.add_all().expect("add");
        git.commit_staged("initial").expect("commit");
        repo
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.temp.path())
    }

    /// Write `file` on the current branch and commit it.
    pub fn commit_file(&self, file: &str, contents: &str, message: &str) {
        let path = self.path().join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write file");
        let git = self.git();
        git.add_all().expect("add");
        git.commit_staged(message).expect("commit");
    }

    /// Create `branch` from `main` with one commit writing `file`, then
    /// return to `main`.
    pub fn branch_with_file(&self, branch: &str, file: &str, contents: &str) {
        let git = self.git();
        git.checkout_or_create(branch, "main").expect("branch");
        self.commit_file(file, contents, &format!("{branch}: {file}"));
        git.checkout_branch("main").expect("back to main");
    }

    pub fn run_git(&self, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}
