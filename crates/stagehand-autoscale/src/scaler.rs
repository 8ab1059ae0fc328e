//! Scaling decisions and the per-deployment control loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use stagehand_rollout::provider::mean;
use stagehand_rollout::{
    Cohort, DeploymentLocks, InstanceSpec, MetricQuery, MetricsSource, Provisioner, RequestToken,
    RetryPolicy, TrafficRoute,
};
use stagehand_state::{Deployment, StateStore};

use crate::error::{ScaleError, ScaleResult};
use crate::policy::{AutoscalePolicy, recommend};

/// Outcome of one autoscaler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Change the active set to this many instances.
    ScaleTo(u32),
    /// Recommendation is within `min_change` of the current count.
    NoChange,
    /// No usable metric data this tick.
    Skipped,
    /// A strategy transition has traffic split or moving.
    Deferred,
    /// Scale-down held back by the stabilization window.
    Suppressed { recommended: u32 },
}

/// Decision state for one deployment: stabilization and missed-tick
/// tracking.
#[derive(Debug)]
pub struct Scaler {
    policy: AutoscalePolicy,
    last_scale_up: Option<Instant>,
    missed_ticks: u32,
}

impl Scaler {
    pub fn new(policy: AutoscalePolicy) -> Self {
        Self {
            policy,
            last_scale_up: None,
            missed_ticks: 0,
        }
    }

    pub fn policy(&self) -> &AutoscalePolicy {
        &self.policy
    }

    /// Consecutive ticks without usable metrics.
    pub fn missed_ticks(&self) -> u32 {
        self.missed_ticks
    }

    /// Start the stabilization window. Called once a scale-up has been
    /// applied.
    pub fn record_scale_up(&mut self, at: Instant) {
        self.last_scale_up = Some(at);
    }

    /// Decide what to do for `deployment` given the observed metric mean.
    pub fn evaluate(
        &mut self,
        deployment: &Deployment,
        observed: Option<f64>,
        now: Instant,
    ) -> ScaleDecision {
        if deployment.strategy_state.blocks_scaling() {
            debug!(
                deployment = %deployment.id,
                state = deployment.strategy_state.name(),
                "tick deferred during transition"
            );
            return ScaleDecision::Deferred;
        }

        let Some(observed) = observed else {
            self.missed_ticks += 1;
            if self.missed_ticks >= self.policy.alert_after_missed {
                error!(
                    deployment = %deployment.id,
                    metric = %self.policy.metric,
                    missed = self.missed_ticks,
                    alert = "autoscaler_metrics_missing",
                    "no metrics for consecutive ticks, capacity unchanged"
                );
            } else {
                warn!(
                    deployment = %deployment.id,
                    metric = %self.policy.metric,
                    missed = self.missed_ticks,
                    "no metrics, tick skipped"
                );
            }
            return ScaleDecision::Skipped;
        };
        self.missed_ticks = 0;

        let current = deployment.instance_count;
        let desired = recommend(current, observed, self.policy.target, deployment.instances);
        if desired.abs_diff(current) < self.policy.min_change || desired == current {
            return ScaleDecision::NoChange;
        }

        if desired < current
            && let Some(scaled_up) = self.last_scale_up
            && now.saturating_duration_since(scaled_up) < self.policy.stabilization_window()
        {
            debug!(
                deployment = %deployment.id,
                current,
                recommended = desired,
                "scale-down suppressed by stabilization window"
            );
            return ScaleDecision::Suppressed {
                recommended: desired,
            };
        }

        info!(
            deployment = %deployment.id,
            from = current,
            to = desired,
            metric = %self.policy.metric,
            observed,
            target = self.policy.target,
            "scaling"
        );
        ScaleDecision::ScaleTo(desired)
    }
}

/// Control loop for one deployment.
pub struct ScaleLoop {
    deployment_id: String,
    scaler: Scaler,
    store: StateStore,
    provisioner: Arc<dyn Provisioner>,
    metrics: Arc<dyn MetricsSource>,
    locks: DeploymentLocks,
    retry: RetryPolicy,
}

impl ScaleLoop {
    pub fn new(
        deployment_id: &str,
        policy: AutoscalePolicy,
        store: StateStore,
        provisioner: Arc<dyn Provisioner>,
        metrics: Arc<dyn MetricsSource>,
        locks: DeploymentLocks,
    ) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            scaler: Scaler::new(policy),
            store,
            provisioner,
            metrics,
            locks,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    /// Mean of the policy metric over the trailing window, if any.
    pub async fn observe(&self) -> Option<f64> {
        let policy = self.scaler.policy();
        let query = MetricQuery {
            deployment: self.deployment_id.clone(),
            cohort: None,
            metric: policy.metric.clone(),
            window: policy.window(),
        };
        match self.metrics.query(&query).await {
            Ok(samples) => mean(&samples),
            Err(e) => {
                debug!(deployment = %self.deployment_id, error = %e, "metric query failed");
                None
            }
        }
    }

    /// Run one tick: observe, decide and apply under the scaling lock.
    pub async fn tick(&mut self) -> ScaleResult<ScaleDecision> {
        let observed = self.observe().await;

        let lock = self.locks.scaling(&self.deployment_id);
        let _guard = lock.lock_owned().await;
        let deployment = self
            .store
            .get_deployment(&self.deployment_id)?
            .ok_or_else(|| ScaleError::UnknownDeployment(self.deployment_id.clone()))?;

        let decision = self.scaler.evaluate(&deployment, observed, Instant::now());
        if let ScaleDecision::ScaleTo(target) = decision {
            self.apply(&deployment, target).await?;
            if target > deployment.instance_count {
                self.scaler.record_scale_up(Instant::now());
            }
        }
        Ok(decision)
    }

    /// Grow or shrink the active set to `target` instances. New instances
    /// are routed after they exist; removed ones are routed away first.
    async fn apply(&self, deployment: &Deployment, target: u32) -> ScaleResult<()> {
        let id = deployment.id.as_str();
        let current = deployment.active_instances.len() as u32;
        let digest = deployment.active_image.digest.as_str();
        let step = format!("{current}->{target}@{}", deployment.updated_at);
        let route_token = RequestToken::derive(id, digest, "scale_route", &step);

        if target > current {
            let spec = InstanceSpec {
                deployment_id: id.to_string(),
                image: deployment.active_image.clone(),
                cohort: Cohort::Baseline,
            };
            let token = RequestToken::derive(id, digest, "scale_up", &step);
            let added = self
                .retry
                .run("create_instances", None, || {
                    self.provisioner
                        .create_instances(&token, &spec, target - current)
                })
                .await?;
            let mut instances = deployment.active_instances.clone();
            instances.extend(added.iter().cloned());
            let route = TrafficRoute::stable_only(id, &instances);
            let routed = self
                .retry
                .run("switch_traffic", None, || {
                    self.provisioner.switch_traffic(&route_token, &route)
                })
                .await
                .map_err(ScaleError::from)
                .and_then(|()| self.record(id, instances, target));
            if let Err(e) = routed {
                self.undo_scale_up(deployment, &step, &added).await;
                return Err(e);
            }
        } else {
            let keep = target as usize;
            let (kept, removed) = deployment.active_instances.split_at(keep.min(current as usize));
            let route = TrafficRoute::stable_only(id, kept);
            self.retry
                .run("switch_traffic", None, || {
                    self.provisioner.switch_traffic(&route_token, &route)
                })
                .await?;
            let token = RequestToken::derive(id, digest, "scale_down", &step);
            self.retry
                .run("remove_instances", None, || {
                    self.provisioner.remove_instances(&token, removed)
                })
                .await?;
            self.record(id, kept.to_vec(), target)?;
        }
        Ok(())
    }

    fn record(&self, id: &str, instances: Vec<String>, target: u32) -> ScaleResult<()> {
        let updated = self.store.update_deployment(id, |d| {
            d.instance_count = instances.len() as u32;
            d.desired_instance_count = d.instances.clamp(target);
            d.active_instances = instances;
            Ok(())
        })?;
        debug!(deployment = %id, instances = updated.instance_count, "capacity applied");
        Ok(())
    }

    /// Put the route back on the recorded active set and stop the instances
    /// a failed scale-up created.
    async fn undo_scale_up(&self, deployment: &Deployment, step: &str, added: &[String]) {
        let id = deployment.id.as_str();
        let digest = deployment.active_image.digest.as_str();
        let route = TrafficRoute::stable_only(id, &deployment.active_instances);
        let route_token = RequestToken::derive(id, digest, "scale_up_undo_route", step);
        if let Err(e) = self
            .retry
            .run("switch_traffic", None, || {
                self.provisioner.switch_traffic(&route_token, &route)
            })
            .await
        {
            warn!(deployment = %id, error = %e, "could not restore route after failed scale-up");
        }
        let token = RequestToken::derive(id, digest, "scale_up_undo", step);
        match self
            .retry
            .run("remove_instances", None, || {
                self.provisioner.remove_instances(&token, added)
            })
            .await
        {
            Ok(()) => info!(deployment = %id, removed = added.len(), "failed scale-up rolled back"),
            Err(e) => error!(
                deployment = %id,
                instances = ?added,
                error = %e,
                "could not remove instances of a failed scale-up"
            ),
        }
    }

    /// Tick until shutdown or until the deployment disappears.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let policy = self.scaler.policy().clone();
        info!(
            deployment = %self.deployment_id,
            metric = %policy.metric,
            target = policy.target,
            tick_secs = policy.tick_secs,
            "autoscale loop started"
        );

        let mut delay = policy.tick();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    delay = match self.tick().await {
                        Ok(ScaleDecision::Deferred) => policy.defer_retry(),
                        Ok(_) => policy.tick(),
                        Err(ScaleError::UnknownDeployment(_)) => {
                            info!(deployment = %self.deployment_id, "deployment removed, autoscale loop stopping");
                            break;
                        }
                        Err(e) => {
                            warn!(deployment = %self.deployment_id, error = %e, "autoscale tick failed");
                            policy.tick()
                        }
                    };
                }
                _ = shutdown.changed() => {
                    debug!(deployment = %self.deployment_id, "autoscale loop shutting down");
                    break;
                }
            }
        }
    }
}
