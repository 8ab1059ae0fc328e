//! Collaborator traits — provisioner, metrics source, health probe.
//!
//! Stagehand never talks to real infrastructure itself. Everything that
//! creates instances, moves traffic or reads metrics goes through these
//! traits, so the daemon can be wired to any backend and tests can use the
//! in-memory implementations in [`crate::memory`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use stagehand_state::{DeploymentId, Image, InstanceId, MetricSample};

use crate::error::ProvisionError;

pub const METRIC_CPU_UTILIZATION: &str = "cpu_utilization";
pub const METRIC_MEMORY_UTILIZATION: &str = "memory_utilization";
pub const METRIC_REQUEST_RATE: &str = "request_rate";
pub const METRIC_ERROR_RATE: &str = "error_rate";
pub const METRIC_P99_LATENCY_MS: &str = "p99_latency_ms";

/// Which side of a traffic split a query or instance set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cohort {
    Baseline,
    Candidate,
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Baseline => f.write_str("baseline"),
            Self::Candidate => f.write_str("candidate"),
        }
    }
}

/// Deterministic idempotency key for a provisioner call.
///
/// Derived from the deployment, the image digest, the operation and the
/// step, so a retried call, or the same call issued again after a restart,
/// carries the same token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestToken(String);

impl RequestToken {
    pub fn derive(deployment_id: &str, digest: &str, operation: &str, step: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{deployment_id}|{digest}|{operation}|{step}").as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to run when creating instances.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub deployment_id: DeploymentId,
    pub image: Image,
    pub cohort: Cohort,
}

/// Full desired routing state of one deployment.
///
/// Routes are never deltas: applying the same route twice leaves traffic
/// where the first call put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRoute {
    pub deployment_id: DeploymentId,
    pub stable: Vec<InstanceId>,
    pub candidate: Vec<InstanceId>,
    /// Percentage of traffic sent to `candidate` (0-100).
    pub candidate_weight: u8,
}

impl TrafficRoute {
    /// All traffic to a single instance set.
    pub fn stable_only(deployment_id: &str, stable: &[InstanceId]) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            stable: stable.to_vec(),
            candidate: Vec::new(),
            candidate_weight: 0,
        }
    }

    /// Split traffic between the active and candidate sets.
    pub fn split(
        deployment_id: &str,
        stable: &[InstanceId],
        candidate: &[InstanceId],
        candidate_weight: u8,
    ) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            stable: stable.to_vec(),
            candidate: candidate.to_vec(),
            candidate_weight: candidate_weight.min(100),
        }
    }
}

/// Query over a metric series.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub deployment: DeploymentId,
    /// `None` queries the deployment as a whole.
    pub cohort: Option<Cohort>,
    pub metric: String,
    /// Trailing window ending now.
    pub window: Duration,
}

/// The metrics source could not answer a query.
#[derive(Debug, Clone, Error)]
#[error("metrics unavailable: {0}")]
pub struct MetricsError(pub String);

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// Every probed instance answered healthy.
    Healthy,
    /// At least one instance answered unhealthy.
    Unhealthy,
    /// The probe could not be executed.
    Failed,
}

/// Creates and removes instances and programs the router.
///
/// Implementations must treat a repeated token as the same request: return
/// the original result without acting twice.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start `count` instances of `spec`. Returns their IDs.
    async fn create_instances(
        &self,
        token: &RequestToken,
        spec: &InstanceSpec,
        count: u32,
    ) -> Result<Vec<InstanceId>, ProvisionError>;

    /// Stop the given instances. Unknown IDs are ignored.
    async fn remove_instances(
        &self,
        token: &RequestToken,
        instances: &[InstanceId],
    ) -> Result<(), ProvisionError>;

    /// Apply a full routing state for a deployment.
    async fn switch_traffic(
        &self,
        token: &RequestToken,
        route: &TrafficRoute,
    ) -> Result<(), ProvisionError>;
}

/// Reads metric series.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<MetricSample>, MetricsError>;
}

/// Probes the health of a set of instances.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, deployment_id: &str, instances: &[InstanceId]) -> ProbeResult;
}

/// Mean of a series, or `None` when it is empty.
pub fn mean(samples: &[MetricSample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let sum: f64 = samples.iter().map(|s| s.value).sum();
    Some(sum / samples.len() as f64)
}
