//! Stable exit codes for foreman CLI commands.

use crate::error::{CheckpointInconsistent, ConflictDetected, NoSlotAvailable};
use crate::session::SessionOutcome;

/// Command succeeded; `run` reached COMPLETE.
pub const OK: i32 = 0;
/// Invalid layout, config, graph or arguments, or any unclassified error.
pub const INVALID: i32 = 1;
/// `run` stopped with stuck tasks (escalation reached Ask).
pub const STUCK: i32 = 3;
/// `run` checkpointed and handed off to a fresh session.
pub const HANDOFF: i32 = 4;
/// Integration stopped on an unresolved merge conflict.
pub const CONFLICT: i32 = 5;
/// A checkpoint no longer matches the repository; resume refused.
pub const CHECKPOINT_INCONSISTENT: i32 = 6;
/// `acquire` found no idle slot.
pub const NO_SLOT: i32 = 7;

/// Exit code for a command that failed with `err`.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<NoSlotAvailable>().is_some() {
        NO_SLOT
    } else if err.downcast_ref::<CheckpointInconsistent>().is_some() {
        CHECKPOINT_INCONSISTENT
    } else if err.downcast_ref::<ConflictDetected>().is_some() {
        CONFLICT
    } else {
        INVALID
    }
}

/// Exit code for a `run` that returned normally.
pub fn for_outcome(outcome: &SessionOutcome) -> i32 {
    match outcome {
        SessionOutcome::Complete => OK,
        SessionOutcome::Stuck { .. } => STUCK,
        SessionOutcome::Handoff { .. } => HANDOFF,
        SessionOutcome::Conflict(_) => CONFLICT,
        SessionOutcome::VerificationFailed(_) => INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskId;

    #[test]
    fn typed_errors_pick_their_codes_through_context() {
        let err = anyhow::Error::new(NoSlotAvailable { task_id: TaskId(3) }).context("acquire");
        assert_eq!(for_error(&err), NO_SLOT);

        let err = anyhow::Error::new(ConflictDetected {
            task_id: TaskId(2),
            branch: "foreman/task-2".to_string(),
            files: vec!["a.rs".to_string()],
        });
        assert_eq!(for_error(&err), CONFLICT);
        assert_eq!(for_error(&anyhow::anyhow!("bad config")), INVALID);
    }

    #[test]
    fn outcomes_map_to_codes() {
        assert_eq!(for_outcome(&SessionOutcome::Complete), OK);
        assert_eq!(
            for_outcome(&SessionOutcome::Handoff {
                checkpoint_id: "cp-0001".to_string()
            }),
            HANDOFF
        );
        assert_eq!(
            for_outcome(&SessionOutcome::Stuck {
                reports: Vec::new()
            }),
            STUCK
        );
    }
}
