//! Autoscale policy and the sizing formula.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use stagehand_state::InstanceBounds;

use crate::error::{ScaleError, ScaleResult};

/// How one deployment is scaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalePolicy {
    /// Metric read from the metrics source.
    pub metric: String,
    /// Per-instance target value of `metric`.
    pub target: f64,
    /// Trailing window the metric is averaged over.
    pub window_secs: u64,
    /// Seconds between ticks.
    pub tick_secs: u64,
    /// Scale-down is suppressed this long after a scale-up.
    pub stabilization_window_secs: u64,
    /// Smallest instance-count change worth applying.
    pub min_change: u32,
    /// Consecutive ticks without metrics before an alert is raised.
    pub alert_after_missed: u32,
    /// Retry delay for a tick deferred by a strategy transition.
    pub defer_retry_secs: u64,
}

impl Default for AutoscalePolicy {
    fn default() -> Self {
        Self {
            metric: "cpu_utilization".to_string(),
            target: 60.0,
            window_secs: 300,
            tick_secs: 30,
            stabilization_window_secs: 300,
            min_change: 1,
            alert_after_missed: 3,
            defer_retry_secs: 5,
        }
    }
}

impl AutoscalePolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn stabilization_window(&self) -> Duration {
        Duration::from_secs(self.stabilization_window_secs)
    }

    pub fn defer_retry(&self) -> Duration {
        Duration::from_secs(self.defer_retry_secs)
    }

    pub fn validate(&self) -> ScaleResult<()> {
        if self.metric.trim().is_empty() {
            return Err(ScaleError::Policy("metric must not be empty".into()));
        }
        if !self.target.is_finite() || self.target <= 0.0 {
            return Err(ScaleError::Policy(format!(
                "target must be positive, got {}",
                self.target
            )));
        }
        if self.tick_secs == 0 || self.window_secs == 0 || self.defer_retry_secs == 0 {
            return Err(ScaleError::Policy(
                "tick_secs, window_secs and defer_retry_secs must be at least 1".into(),
            ));
        }
        if self.min_change == 0 || self.alert_after_missed == 0 {
            return Err(ScaleError::Policy(
                "min_change and alert_after_missed must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Recommended instance count: `round(current * observed / target)`,
/// clamped to `bounds`.
pub fn recommend(current: u32, observed: f64, target: f64, bounds: InstanceBounds) -> u32 {
    let raw = f64::from(current) * observed / target;
    if !raw.is_finite() {
        return bounds.clamp(current);
    }
    let rounded = raw.round().clamp(0.0, f64::from(u32::MAX)) as u32;
    bounds.clamp(rounded)
}
