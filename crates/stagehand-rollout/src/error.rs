//! Error types for strategy transitions.

use thiserror::Error;

use stagehand_state::StateError;

use crate::provider::Cohort;

/// Result type alias for strategy engine operations.
pub type PromotionResult<T> = Result<T, PromotionError>;

/// A provisioner call failed.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed: {message}")]
pub struct ProvisionError {
    pub operation: String,
    pub message: String,
    /// Whether repeating the call (with the same token) may succeed.
    pub retryable: bool,
}

impl ProvisionError {
    pub fn retryable(operation: &str, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: &str, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// The candidate did not prove itself healthy. Never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerificationFailure {
    #[error("health probe failed after {passed} healthy probes")]
    ProbeFailed { passed: u32 },

    #[error("verification timed out with {passed}/{required} healthy probes")]
    Timeout { passed: u32, required: u32 },

    #[error("no {metric} data for the {cohort} cohort at {weight}%")]
    MissingData {
        cohort: Cohort,
        metric: String,
        weight: u8,
    },

    #[error("candidate error rate {candidate:.4} exceeds {threshold:.4} at {weight}%")]
    ErrorRate {
        candidate: f64,
        threshold: f64,
        weight: u8,
    },

    #[error("candidate p99 latency {candidate:.1}ms exceeds {limit:.1}ms at {weight}%")]
    Latency { candidate: f64, limit: f64, weight: u8 },
}

/// Why a step of a transition stopped before completing.
#[derive(Debug, Clone, Error)]
pub enum Interrupted {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Verification(#[from] VerificationFailure),

    #[error("cancelled")]
    Cancelled,
}

/// Errors returned by the strategy engine.
#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("invalid strategy configuration: {0}")]
    Configuration(String),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("deployment busy: {0}")]
    Busy(String),

    #[error("cancelled before any change was made")]
    Cancelled,

    #[error("rolled back: {reason}")]
    RolledBack { reason: String },

    #[error("degraded: {reason}")]
    Degraded { reason: String },

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
