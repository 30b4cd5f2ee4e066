//! Connector state machine.
//!
//! ```text
//! STARTING ──► RUNNING ──► UPDATING ──► RUNNING
//!    │            ▲            ▲  │
//!    ├────────────┼────────────┘  │
//!    ▼            │               ▼
//!  FAILED ────────┴──────────► UPDATING
//!
//! any non-deleting ──► FAILED
//! any ──► DELETING ──► (removed)
//! ```

use tracing::debug;

use conduit_state::{ConnectorRecord, ConnectorState, epoch_secs};

use crate::error::{LifecycleError, LifecycleResult};

/// Whether a connector may move from `from` to `to`.
pub fn can_transition(from: ConnectorState, to: ConnectorState) -> bool {
    use ConnectorState::*;
    if from == to {
        return true;
    }
    match (from, to) {
        (_, Deleting) => true,
        (Deleting, _) => false,
        (_, Failed) => true,
        (Starting, Running) | (Updating, Running) | (Failed, Running) => true,
        (Starting, Updating) | (Running, Updating) | (Failed, Updating) => true,
        _ => false,
    }
}

/// Move `record` to `to`, refreshing its timestamp.
pub fn transition(record: &mut ConnectorRecord, to: ConnectorState) -> LifecycleResult<()> {
    let from = record.state;
    if !can_transition(from, to) {
        return Err(LifecycleError::Internal(format!(
            "illegal state transition {} -> {} for {}",
            from.as_str(),
            to.as_str(),
            record.id
        )));
    }
    if from != to {
        debug!(connector = %record.id, from = from.as_str(), to = to.as_str(), "state transition");
    }
    record.state = to;
    record.updated_at = epoch_secs();
    Ok(())
}
