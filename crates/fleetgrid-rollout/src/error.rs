//! Rollout engine error types.

use fleetgrid_state::RolloutStatus;
use thiserror::Error;

/// Errors that can occur during rollout operations.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("rollout not found: {0}")]
    RolloutNotFound(String),

    #[error("rollout already exists: {0}")]
    DuplicateRollout(String),

    #[error("distribution set not found: {0}")]
    DistributionSetNotFound(String),

    #[error("invalid rollout name: {0}")]
    InvalidName(String),

    #[error("invalid target filter: {0}")]
    InvalidFilter(String),

    #[error("no targets match filter: {0}")]
    NoMatchingTargets(String),

    #[error("invalid group definition: {0}")]
    InvalidGroupDefinition(String),

    #[error("too many groups: {requested} requested, at most {max} allowed")]
    TooManyGroups { requested: usize, max: usize },

    #[error("cannot {operation} rollout {rollout_id} in status {status:?}")]
    NotAllowed {
        rollout_id: String,
        status: RolloutStatus,
        operation: &'static str,
    },

    #[error("concurrent update: {0}")]
    Conflict(String),

    #[error("group order corrupted: {0}")]
    GroupOrderCorrupted(String),

    #[error("deployment error: {0}")]
    Deploy(#[from] fleetgrid_deploy::DeployError),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
