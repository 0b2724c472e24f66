//! Deployment error types.

use thiserror::Error;

/// Errors that can occur while managing actions.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("feedback not allowed: {0}")]
    NotAllowed(String),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

pub type DeployResult<T> = Result<T, DeployError>;
