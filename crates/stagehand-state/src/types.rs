//! Domain types for the Stagehand state store.
//!
//! These types represent the persisted state of deployments, promotion
//! records, and indexed images. All types are serializable to/from JSON for
//! storage in redb tables.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Identifier of a deployment: `{environment}/{service}`.
pub type DeploymentId = String;

/// Identifier of a provisioned instance, assigned by the provisioner.
pub type InstanceId = String;

/// Identifier of a promotion record: `{service}:{seq}`.
pub type PromotionId = String;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Image ─────────────────────────────────────────────────────────

/// A pushed container image. Immutable once registered; the digest is the
/// canonical identity and the tag is only the pointer it was pushed under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub repository: String,
    pub tag: String,
    /// Content digest, `sha256:<hex>`.
    pub digest: String,
    /// Unix timestamp (seconds) when the image was first registered.
    pub created_at: u64,
}

impl Image {
    pub fn new(repository: &str, tag: &str, digest: &str) -> Self {
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: digest.to_string(),
            created_at: epoch_secs(),
        }
    }

    /// Full pull reference, `{repository}:{tag}@{digest}`.
    pub fn reference(&self) -> String {
        format!("{}:{}@{}", self.repository, self.tag, self.digest)
    }

    /// Digest without the algorithm prefix, truncated to 12 characters.
    pub fn short_digest(&self) -> &str {
        let hex = self
            .digest
            .split_once(':')
            .map(|(_, hex)| hex)
            .unwrap_or(&self.digest);
        &hex[..hex.len().min(12)]
    }

    /// Build the composite key for the images table.
    pub fn table_key(&self) -> String {
        format!("{}@{}", self.repository, self.digest)
    }

    /// Whether two images are the same content, regardless of tag.
    pub fn same_content(&self, other: &Image) -> bool {
        self.repository == other.repository && self.digest == other.digest
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// An indexed image together with its promotion history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageEntry {
    pub image: Image,
    /// Environments this digest has been committed to, in promotion order.
    pub promotions: Vec<EnvironmentPromotion>,
}

/// A successful promotion of an image into an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentPromotion {
    pub environment: String,
    pub promoted_at: u64,
}

impl ImageEntry {
    pub fn new(image: Image) -> Self {
        Self {
            image,
            promotions: Vec::new(),
        }
    }

    /// Whether this digest has been committed to `environment`.
    pub fn promoted_to(&self, environment: &str) -> bool {
        self.promotions.iter().any(|p| p.environment == environment)
    }

    /// Most recent promotion time into `environment`, if any.
    pub fn last_promoted_at(&self, environment: &str) -> Option<u64> {
        self.promotions
            .iter()
            .filter(|p| p.environment == environment)
            .map(|p| p.promoted_at)
            .max()
    }
}

// ── Deployment ────────────────────────────────────────────────────

/// Min/max instance count for a deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceBounds {
    pub min: u32,
    pub max: u32,
}

impl InstanceBounds {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Clamp an instance count into `[min, max]`.
    pub fn clamp(&self, count: u32) -> u32 {
        count.max(self.min).min(self.max)
    }

    pub fn contains(&self, count: u32) -> bool {
        count >= self.min && count <= self.max
    }

    pub fn is_valid(&self) -> bool {
        self.max >= 1 && self.min <= self.max
    }
}

/// State of the strategy state machine for a deployment.
///
/// `Committed`, `RolledBack` and `Idle` are resting states; `Degraded` is
/// terminal until an operator resolves it. Everything else means a
/// transition is in progress and a candidate image is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StrategyState {
    /// Active image serves all traffic; no transition has run yet.
    Idle,
    /// Candidate instance set is being created next to the active set.
    Provisioning,
    /// Router is being repointed (blue/green cutover).
    TrafficSwitching,
    /// Blue/green health-check window.
    Verifying { probes_passed: u32 },
    /// Canary: shifting traffic to `weight` percent at `step`.
    RampUp { step: usize, weight: u8 },
    /// Canary: holding `weight` percent for the analysis window.
    Analyzing { step: usize, weight: u8 },
    /// Traffic is being returned to the active set.
    RollingBack,
    /// Last transition committed its candidate.
    Committed,
    /// Last transition was rolled back cleanly.
    RolledBack { reason: String },
    /// A rollback failed; needs manual intervention.
    Degraded { reason: String },
}

impl StrategyState {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::TrafficSwitching => "traffic_switching",
            Self::Verifying { .. } => "verifying",
            Self::RampUp { .. } => "ramp_up",
            Self::Analyzing { .. } => "analyzing",
            Self::RollingBack => "rolling_back",
            Self::Committed => "committed",
            Self::RolledBack { .. } => "rolled_back",
            Self::Degraded { .. } => "degraded",
        }
    }

    /// A strategy transition is in progress.
    pub fn in_transition(&self) -> bool {
        matches!(
            self,
            Self::Provisioning
                | Self::TrafficSwitching
                | Self::Verifying { .. }
                | Self::RampUp { .. }
                | Self::Analyzing { .. }
                | Self::RollingBack
        )
    }

    /// Traffic may be split or pointed away from the active set, so the
    /// autoscaler must not change capacity.
    pub fn blocks_scaling(&self) -> bool {
        matches!(
            self,
            Self::TrafficSwitching
                | Self::Verifying { .. }
                | Self::RampUp { .. }
                | Self::Analyzing { .. }
                | Self::RollingBack
                | Self::Degraded { .. }
        )
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verifying { probes_passed } => write!(f, "verifying({probes_passed})"),
            Self::RampUp { step, weight } => write!(f, "ramp_up(step={step}, weight={weight}%)"),
            Self::Analyzing { step, weight } => {
                write!(f, "analyzing(step={step}, weight={weight}%)")
            }
            Self::RolledBack { reason } => write!(f, "rolled_back: {reason}"),
            Self::Degraded { reason } => write!(f, "degraded: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

/// The live deployment of one service in one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub environment: String,
    pub service: String,
    /// Image serving (at least the stable share of) traffic.
    pub active_image: Image,
    /// Image being rolled out; present only during a transition.
    pub candidate_image: Option<Image>,
    pub strategy_state: StrategyState,
    /// Running instances in the active set.
    pub instance_count: u32,
    /// Last capacity the autoscaler asked for.
    pub desired_instance_count: u32,
    pub instances: InstanceBounds,
    pub active_instances: Vec<InstanceId>,
    pub candidate_instances: Vec<InstanceId>,
    /// Percentage of traffic currently routed to the candidate set.
    pub candidate_weight: u8,
    /// Bumped each time a transition starts. Part of every provisioner
    /// request token, so a retried or recovered transition repeats its
    /// tokens while a later transition of the same digest does not.
    #[serde(default)]
    pub generation: u64,
    /// Unix timestamp of the last update.
    pub updated_at: u64,
}

impl Deployment {
    /// Create a deployment whose active set is already running.
    pub fn new(
        environment: &str,
        service: &str,
        active_image: Image,
        instances: InstanceBounds,
        active_instances: Vec<InstanceId>,
    ) -> Self {
        let count = active_instances.len() as u32;
        Self {
            id: Self::make_id(environment, service),
            environment: environment.to_string(),
            service: service.to_string(),
            active_image,
            candidate_image: None,
            strategy_state: StrategyState::Idle,
            instance_count: count,
            desired_instance_count: instances.clamp(count),
            instances,
            active_instances,
            candidate_instances: Vec::new(),
            candidate_weight: 0,
            generation: 0,
            updated_at: epoch_secs(),
        }
    }

    /// Build a deployment ID from its environment and service.
    pub fn make_id(environment: &str, service: &str) -> DeploymentId {
        format!("{environment}/{service}")
    }

    /// Build the composite key for the deployments table.
    pub fn table_key(&self) -> String {
        self.id.clone()
    }

    /// Instance count a candidate set should be created with.
    pub fn candidate_size(&self) -> u32 {
        self.instances.clamp(self.instance_count).max(1)
    }
}

// ── Promotions ────────────────────────────────────────────────────

/// Outcome of a promotion into one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionOutcome {
    Pending,
    Succeeded,
    Failed,
    RolledBack,
}

impl PromotionOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether a sequence of promotions should stop after this outcome.
    pub fn halts_sequence(&self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for PromotionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry for one image entering one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionRecord {
    /// Assigned by the store on insert.
    pub id: PromotionId,
    pub service: String,
    pub image: Image,
    /// Environment the image was promoted from; `None` for the first one.
    pub from_env: Option<String>,
    pub to_env: String,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub outcome: PromotionOutcome,
    /// Human-readable explanation of the outcome.
    pub reason: String,
}

impl PromotionRecord {
    /// Create a pending record; the ID is assigned when it is stored.
    pub fn pending(service: &str, image: Image, from_env: Option<&str>, to_env: &str) -> Self {
        Self {
            id: String::new(),
            service: service.to_string(),
            image,
            from_env: from_env.map(str::to_string),
            to_env: to_env.to_string(),
            started_at: epoch_secs(),
            finished_at: None,
            outcome: PromotionOutcome::Pending,
            reason: "promotion started".to_string(),
        }
    }

    /// Build the key for a service/sequence pair.
    pub fn make_id(service: &str, seq: u64) -> PromotionId {
        format!("{service}:{seq:010}")
    }

    /// Record the final outcome. Only `pending -> terminal` is allowed.
    pub fn complete(&mut self, outcome: PromotionOutcome, reason: &str) -> StateResult<()> {
        if self.outcome.is_terminal() {
            return Err(StateError::InvalidTransition(format!(
                "promotion {} already {}",
                self.id, self.outcome
            )));
        }
        if !outcome.is_terminal() {
            return Err(StateError::InvalidTransition(format!(
                "promotion {} cannot complete as pending",
                self.id
            )));
        }
        self.outcome = outcome;
        self.reason = reason.to_string();
        self.finished_at = Some(epoch_secs());
        Ok(())
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// One point of a metric series read from the metrics source. Never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub deployment: DeploymentId,
    pub metric: String,
    pub value: f64,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}
