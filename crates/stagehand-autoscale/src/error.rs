//! Error types for the autoscaler.

use thiserror::Error;

use stagehand_rollout::Interrupted;
use stagehand_state::StateError;

/// Result type alias for autoscaler operations.
pub type ScaleResult<T> = Result<T, ScaleError>;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("invalid autoscale policy: {0}")]
    Policy(String),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("scaling call failed: {0}")]
    Provision(#[from] Interrupted),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
