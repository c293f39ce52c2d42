//! Side-effecting operations: filesystem, git, child processes.

pub mod atomic;
pub mod brief;
pub mod checkpoint;
pub mod config;
pub mod git;
pub mod graph_store;
pub mod handoff;
pub mod journal;
pub mod paths;
pub mod process;
pub mod state_store;
pub mod strategies;
pub mod verify;
pub mod worker;
pub mod workspace;
