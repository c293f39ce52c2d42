//! Phase state machine with guarded transitions.
//!
//! `IDLE -> PLAN -> EXECUTE -> INTEGRATE -> REVIEW -> COMPLETE`, with
//! `CHECKPOINTED` reachable from any phase and resuming into the phase it
//! was entered from.

use anyhow::Result;

use crate::core::types::Phase;
use crate::error::InvalidTransition;

/// Facts the guards need; gathered by the caller from the current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionFacts {
    pub task_count: usize,
    pub graph_acyclic: bool,
    pub all_tasks_terminal: bool,
    pub unresolved_conflicts: usize,
    pub verification_passed: bool,
}

/// Check whether `from -> to` is allowed given `facts`.
///
/// `resume_phase` is the phase stored when entering `CHECKPOINTED`; leaving
/// `CHECKPOINTED` is only allowed back into it.
pub fn check_transition(
    from: Phase,
    to: Phase,
    resume_phase: Option<Phase>,
    facts: &TransitionFacts,
) -> Result<()> {
    let reject = |reason: &str| -> anyhow::Error {
        InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        }
        .into()
    };

    if to == Phase::Checkpointed {
        if from == Phase::Checkpointed {
            return Err(reject("already checkpointed"));
        }
        return Ok(());
    }

    match (from, to) {
        (Phase::Checkpointed, target) => match resume_phase {
            Some(expected) if expected == target => Ok(()),
            Some(expected) => Err(reject(&format!("resume must re-enter {expected}"))),
            None => Err(reject("no resume phase recorded")),
        },
        (Phase::Idle, Phase::Plan) => Ok(()),
        (Phase::Plan, Phase::Execute) => {
            if facts.task_count == 0 {
                return Err(reject("task graph is empty"));
            }
            if !facts.graph_acyclic {
                return Err(reject("task graph has a dependency cycle"));
            }
            Ok(())
        }
        (Phase::Execute, Phase::Integrate) => {
            if !facts.all_tasks_terminal {
                return Err(reject("tasks are still pending or assigned"));
            }
            Ok(())
        }
        (Phase::Integrate, Phase::Review) => {
            if facts.unresolved_conflicts > 0 {
                return Err(reject(&format!(
                    "{} unresolved merge conflict(s)",
                    facts.unresolved_conflicts
                )));
            }
            Ok(())
        }
        (Phase::Review, Phase::Complete) => {
            if !facts.verification_passed {
                return Err(reject("final verification has not passed"));
            }
            Ok(())
        }
        _ => Err(reject("not an edge of the phase machine")),
    }
}
