//! Autonomous task execution orchestrator.
//!
//! A task graph is scheduled onto a fixed pool of git worktrees, failures are
//! escalated through bounded strategies, progress is checkpointed, and the
//! session hands off to a fresh one when its token budget runs low. Done
//! branches are then integrated into the target branch and verified.
//!
//! - **[`core`]**: Pure, deterministic logic (graph, selection, escalation,
//!   budget, phase guards, overlap classification). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, child processes),
//!   behind traits where tests substitute fakes.
//!
//! [`scheduler`], [`merger`], [`pool`] and [`session`] coordinate the two
//! through a single-owner [`runtime::Runtime`] to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod merger;
pub mod pool;
pub mod report;
pub mod runtime;
pub mod scheduler;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
