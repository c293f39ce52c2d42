//! Deterministic, pure orchestration logic.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.
//! Timestamps are passed in by the caller.

pub mod budget;
pub mod escalation;
pub mod events;
pub mod graph;
pub mod invariants;
pub mod overlap;
pub mod phase;
pub mod pool;
pub mod selector;
pub mod state;
pub mod types;
