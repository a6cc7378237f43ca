//! Clone phase transitions

use thiserror::Error;

use virtsnap_common::crd::{ClonePhase, VirtualMachineCloneStatus};
use virtsnap_common::Error;

/// A phase change the clone state machine does not allow
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid clone phase transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current phase
    pub from: ClonePhase,
    /// Requested phase
    pub to: ClonePhase,
}

impl From<InvalidTransition> for Error {
    fn from(e: InvalidTransition) -> Self {
        Error::internal(e.to_string())
    }
}

/// Whether `from -> to` is a legal step
pub fn can_transition(from: ClonePhase, to: ClonePhase) -> bool {
    use ClonePhase::*;
    match (from, to) {
        (Unset, SnapshotInProgress)
        | (SnapshotInProgress, RestoreInProgress)
        | (RestoreInProgress, CreatingTargetVM)
        | (CreatingTargetVM, Succeeded) => true,
        (from, Failed) => !from.is_terminal(),
        _ => false,
    }
}

/// Move the status to `to`
///
/// Returns whether the phase changed. Staying in the current phase is a no-op.
pub fn transition(
    status: &mut VirtualMachineCloneStatus,
    to: ClonePhase,
) -> Result<bool, InvalidTransition> {
    let from = status.phase;
    if from == to {
        return Ok(false);
    }
    if !can_transition(from, to) {
        return Err(InvalidTransition { from, to });
    }
    status.phase = to;
    Ok(true)
}
