//! Lifecycle error taxonomy.
//!
//! Every lower-level error is folded into one of these variants; the admin
//! API maps each variant onto an HTTP status.

use thiserror::Error;

use conduit_core::{ConfigError, IdentityError, PackageError};
use conduit_state::StateError;
use conduit_supervisor::SupervisorError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0} doesn't exist")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("package unavailable: {0}")]
    PackageUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

impl From<IdentityError> for LifecycleError {
    fn from(e: IdentityError) -> Self {
        LifecycleError::InvalidRequest(e.to_string())
    }
}

impl From<PackageError> for LifecycleError {
    fn from(e: PackageError) -> Self {
        LifecycleError::InvalidRequest(e.to_string())
    }
}

impl From<ConfigError> for LifecycleError {
    fn from(e: ConfigError) -> Self {
        LifecycleError::InvalidConfig(e.to_string())
    }
}

impl From<StateError> for LifecycleError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::AlreadyExists(key) => LifecycleError::AlreadyExists(key),
            other => LifecycleError::Internal(other.to_string()),
        }
    }
}

impl From<SupervisorError> for LifecycleError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::InstanceNotFound {
                connector,
                instance_id,
            } => LifecycleError::NotFound(format!("instance {instance_id} of {connector}")),
            SupervisorError::State(inner) => inner.into(),
            other => LifecycleError::Internal(other.to_string()),
        }
    }
}
