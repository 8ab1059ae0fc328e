//! Error types for the release orchestrator.

use thiserror::Error;

use stagehand_registry::RegistryError;
use stagehand_rollout::PromotionError;
use stagehand_state::StateError;

/// Result type alias for orchestrator operations.
pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// Errors returned by the release orchestrator.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("invalid release configuration: {0}")]
    Configuration(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("no pending approval for promotion {0}")]
    UnknownApproval(String),

    /// The approval gate stayed unresolved. The record is still pending
    /// and the run can be resumed.
    #[error("approval for promotion {promotion_id} into {environment} timed out")]
    ApprovalTimeout {
        promotion_id: String,
        environment: String,
    },

    #[error("promotion queue closed")]
    QueueClosed,

    #[error(transparent)]
    Promotion(#[from] PromotionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
