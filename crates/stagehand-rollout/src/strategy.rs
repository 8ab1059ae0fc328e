//! Rollout strategies — blue/green and canary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PromotionError, PromotionResult};

/// How to move a deployment from its active image to a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Spin up a full parallel set, then switch all traffic at once.
    BlueGreen(BlueGreenConfig),
    /// Shift traffic to the candidate in steps, analysing each one.
    Canary(CanaryConfig),
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self::BlueGreen(BlueGreenConfig::default())
    }
}

impl RolloutStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BlueGreen(_) => "blue_green",
            Self::Canary(_) => "canary",
        }
    }

    /// Reject configurations that could never commit. Runs before any
    /// deployment state is touched.
    pub fn validate(&self) -> PromotionResult<()> {
        match self {
            Self::BlueGreen(cfg) => cfg.validate(),
            Self::Canary(cfg) => cfg.validate(),
        }
    }
}

/// Configuration for blue/green cutovers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueGreenConfig {
    /// Consecutive healthy probes needed to commit.
    pub required_probes: u32,
    /// Seconds between probes.
    pub probe_interval_secs: u64,
    /// Upper bound on the whole verification phase.
    pub max_wait_secs: u64,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            required_probes: 6,
            probe_interval_secs: 10,
            max_wait_secs: 120,
        }
    }
}

impl BlueGreenConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    fn validate(&self) -> PromotionResult<()> {
        if self.required_probes == 0 {
            return Err(config_error("required_probes must be at least 1"));
        }
        if self.probe_interval_secs == 0 {
            return Err(config_error("probe_interval_secs must be at least 1"));
        }
        let window = u64::from(self.required_probes).saturating_mul(self.probe_interval_secs);
        if self.max_wait_secs < window {
            return Err(config_error(format!(
                "max_wait_secs ({}) is shorter than the verification window ({window}s)",
                self.max_wait_secs
            )));
        }
        Ok(())
    }
}

/// Configuration for canary rollouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Candidate traffic percentages, strictly increasing, ending at 100.
    pub steps: Vec<u8>,
    /// Seconds each step is held before it is analysed.
    pub analysis_window_secs: u64,
    /// Candidate error rate may be at most this multiple of the baseline.
    pub error_rate_multiplier: f64,
    /// Error-rate threshold used when the baseline is (near) zero.
    pub error_rate_floor: f64,
    /// Allowed P99 latency increase over the baseline, in milliseconds.
    pub max_latency_delta_ms: f64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            steps: vec![5, 25, 50, 100],
            analysis_window_secs: 60,
            error_rate_multiplier: 1.5,
            error_rate_floor: 0.001,
            max_latency_delta_ms: 100.0,
        }
    }
}

impl CanaryConfig {
    pub fn analysis_window(&self) -> Duration {
        Duration::from_secs(self.analysis_window_secs)
    }

    fn validate(&self) -> PromotionResult<()> {
        let Some(&first) = self.steps.first() else {
            return Err(config_error("canary needs at least one step"));
        };
        // The first step must leave baseline traffic to compare against.
        if first == 0 || first >= 100 {
            return Err(config_error(format!(
                "first canary step must be between 1 and 99, got {first}"
            )));
        }
        if self.steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(config_error(format!(
                "canary steps must be strictly increasing: {:?}",
                self.steps
            )));
        }
        if self.steps.last() != Some(&100) {
            return Err(config_error("last canary step must be 100"));
        }
        if self.steps.iter().any(|&w| w > 100) {
            return Err(config_error("canary steps must not exceed 100"));
        }
        if self.analysis_window_secs == 0 {
            return Err(config_error("analysis_window_secs must be at least 1"));
        }
        if !self.error_rate_multiplier.is_finite() || self.error_rate_multiplier < 1.0 {
            return Err(config_error("error_rate_multiplier must be at least 1.0"));
        }
        if !self.error_rate_floor.is_finite() || self.error_rate_floor < 0.0 {
            return Err(config_error("error_rate_floor must not be negative"));
        }
        if !self.max_latency_delta_ms.is_finite() || self.max_latency_delta_ms < 0.0 {
            return Err(config_error("max_latency_delta_ms must not be negative"));
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> PromotionError {
    PromotionError::Configuration(message.into())
}
