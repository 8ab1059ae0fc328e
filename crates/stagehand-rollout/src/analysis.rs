//! Canary analysis — compare candidate health against the baseline.

use std::time::Duration;

use tracing::debug;

use crate::error::VerificationFailure;
use crate::provider::{
    Cohort, METRIC_ERROR_RATE, METRIC_P99_LATENCY_MS, MetricQuery, MetricsSource, mean,
};
use crate::strategy::CanaryConfig;

/// Averaged error rate and P99 latency of one cohort over a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CohortHealth {
    pub error_rate: f64,
    pub p99_latency_ms: f64,
}

impl CohortHealth {
    /// Read a cohort's health from the metrics source.
    ///
    /// Fails with `MissingData` when either series is empty or the source
    /// errors.
    pub async fn observe(
        metrics: &dyn MetricsSource,
        deployment_id: &str,
        cohort: Cohort,
        window: Duration,
        weight: u8,
    ) -> Result<Self, VerificationFailure> {
        let error_rate = series_mean(metrics, deployment_id, cohort, METRIC_ERROR_RATE, window)
            .await
            .ok_or_else(|| missing(cohort, METRIC_ERROR_RATE, weight))?;
        let p99_latency_ms =
            series_mean(metrics, deployment_id, cohort, METRIC_P99_LATENCY_MS, window)
                .await
                .ok_or_else(|| missing(cohort, METRIC_P99_LATENCY_MS, weight))?;
        Ok(Self {
            error_rate,
            p99_latency_ms,
        })
    }
}

/// Decide whether a canary step is healthy.
///
/// Healthy iff the candidate error rate is at most
/// `max(baseline * multiplier, floor)` and the candidate P99 latency is at
/// most `baseline + max_latency_delta_ms`.
pub fn judge(
    cfg: &CanaryConfig,
    candidate: &CohortHealth,
    baseline: &CohortHealth,
    weight: u8,
) -> Result<(), VerificationFailure> {
    let threshold = (baseline.error_rate * cfg.error_rate_multiplier).max(cfg.error_rate_floor);
    if candidate.error_rate > threshold {
        return Err(VerificationFailure::ErrorRate {
            candidate: candidate.error_rate,
            threshold,
            weight,
        });
    }

    let limit = baseline.p99_latency_ms + cfg.max_latency_delta_ms;
    if candidate.p99_latency_ms > limit {
        return Err(VerificationFailure::Latency {
            candidate: candidate.p99_latency_ms,
            limit,
            weight,
        });
    }

    debug!(
        weight,
        candidate_error_rate = candidate.error_rate,
        threshold,
        candidate_p99 = candidate.p99_latency_ms,
        limit,
        "canary step healthy"
    );
    Ok(())
}

async fn series_mean(
    metrics: &dyn MetricsSource,
    deployment_id: &str,
    cohort: Cohort,
    metric: &str,
    window: Duration,
) -> Option<f64> {
    let query = MetricQuery {
        deployment: deployment_id.to_string(),
        cohort: Some(cohort),
        metric: metric.to_string(),
        window,
    };
    match metrics.query(&query).await {
        Ok(samples) => mean(&samples),
        Err(e) => {
            debug!(deployment = %deployment_id, %cohort, %metric, error = %e, "metric query failed");
            None
        }
    }
}

fn missing(cohort: Cohort, metric: &str, weight: u8) -> VerificationFailure {
    VerificationFailure::MissingData {
        cohort,
        metric: metric.to_string(),
        weight,
    }
}
