//! Supervisor error types.

use thiserror::Error;

use crate::launcher::LaunchError;

/// Errors that can occur during supervision operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("instance {instance_id} not found for {connector}")]
    InstanceNotFound { connector: String, instance_id: u32 },

    #[error("connector has no desired state yet: {0}")]
    NotConfigured(String),

    #[error("teardown incomplete for {connector}: instances {failed:?} could not be stopped")]
    TeardownIncomplete { connector: String, failed: Vec<u32> },

    #[error("no worker nodes configured")]
    NoWorkerNodes,

    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("state store error: {0}")]
    State(#[from] conduit_state::StateError),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
