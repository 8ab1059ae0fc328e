//! Autoscale supervisor — one control loop per live deployment.
//!
//! The supervisor periodically reconciles its loops against the deployments
//! in the state store: a loop is started for every deployment that appears
//! and stopped for every deployment that is removed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use stagehand_rollout::{DeploymentLocks, MetricsSource, Provisioner, RetryPolicy};
use stagehand_state::StateStore;

use crate::policy::AutoscalePolicy;
use crate::scaler::ScaleLoop;

/// How long a stop waits for a loop to finish its current tick.
const LOOP_STOP_GRACE: Duration = Duration::from_secs(120);

/// A running loop.
struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl LoopSlot {
    /// Signal the loop and wait for its current tick to complete. A loop
    /// still busy after the grace period is detached, never aborted.
    async fn stop(self, deployment_id: &str) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(LOOP_STOP_GRACE, self.handle).await {
            Ok(Ok(())) => debug!(%deployment_id, "autoscale loop stopped"),
            Ok(Err(e)) => warn!(%deployment_id, error = %e, "autoscale loop ended abnormally"),
            Err(_) => warn!(
                %deployment_id,
                grace_secs = LOOP_STOP_GRACE.as_secs(),
                "autoscale loop still finishing its tick; left to complete"
            ),
        }
    }
}

/// Owns the autoscale loops of all deployments.
pub struct AutoscaleSupervisor {
    store: StateStore,
    provisioner: Arc<dyn Provisioner>,
    metrics: Arc<dyn MetricsSource>,
    locks: DeploymentLocks,
    retry: RetryPolicy,
    defaults: AutoscalePolicy,
    /// Per-service policy overrides.
    service_policies: HashMap<String, AutoscalePolicy>,
    /// Active loops: deployment_id → slot.
    loops: Arc<RwLock<HashMap<String, LoopSlot>>>,
}

impl AutoscaleSupervisor {
    pub fn new(
        store: StateStore,
        provisioner: Arc<dyn Provisioner>,
        metrics: Arc<dyn MetricsSource>,
        locks: DeploymentLocks,
        defaults: AutoscalePolicy,
    ) -> Self {
        Self {
            store,
            provisioner,
            metrics,
            locks,
            retry: RetryPolicy::default(),
            defaults,
            service_policies: HashMap::new(),
            loops: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Use `policy` for every deployment of `service`.
    pub fn with_service_policy(mut self, service: &str, policy: AutoscalePolicy) -> Self {
        self.service_policies.insert(service.to_string(), policy);
        self
    }

    pub fn policy_for(&self, service: &str) -> &AutoscalePolicy {
        self.service_policies.get(service).unwrap_or(&self.defaults)
    }

    /// Start (or restart) the loop of a deployment.
    pub async fn start_loop(&self, deployment_id: &str, policy: AutoscalePolicy) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scale_loop = ScaleLoop::new(
            deployment_id,
            policy,
            self.store.clone(),
            self.provisioner.clone(),
            self.metrics.clone(),
            self.locks.clone(),
        )
        .with_retry(self.retry);
        let handle = tokio::spawn(scale_loop.run(shutdown_rx));

        let old = self.loops.write().await.insert(
            deployment_id.to_string(),
            LoopSlot {
                handle,
                shutdown_tx,
            },
        );
        info!(%deployment_id, "autoscale loop registered");
        // The old loop takes the scaling lock per tick, so it cannot
        // interleave with the new one.
        if let Some(old) = old {
            old.stop(deployment_id).await;
        }
    }

    /// Stop a loop once its current tick, if any, has completed.
    pub async fn stop_loop(&self, deployment_id: &str) {
        let slot = self.loops.write().await.remove(deployment_id);
        if let Some(slot) = slot {
            slot.stop(deployment_id).await;
            info!(%deployment_id, "autoscale loop stopped");
        }
    }

    /// Stop every loop (graceful shutdown).
    pub async fn stop_all(&self) {
        let slots: Vec<(String, LoopSlot)> = self.loops.write().await.drain().collect();
        for (_, slot) in &slots {
            let _ = slot.shutdown_tx.send(true);
        }
        for (id, slot) in slots {
            slot.stop(&id).await;
        }
        info!("all autoscale loops stopped");
    }

    /// Deployment IDs with a running loop.
    pub async fn active_loops(&self) -> Vec<String> {
        let loops = self.loops.read().await;
        let mut ids: Vec<String> = loops
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn is_running(&self, deployment_id: &str) -> bool {
        let loops = self.loops.read().await;
        loops
            .get(deployment_id)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Bring the set of loops in line with the deployments in the store.
    /// Returns the number of running loops.
    pub async fn reconcile(&self) -> anyhow::Result<usize> {
        let deployments = self.store.list_deployments()?;

        let stale: Vec<String> = {
            let loops = self.loops.read().await;
            loops
                .keys()
                .filter(|id| !deployments.iter().any(|d| &d.id == *id))
                .cloned()
                .collect()
        };
        for id in stale {
            self.stop_loop(&id).await;
        }

        for deployment in &deployments {
            if !self.is_running(&deployment.id).await {
                let policy = self.policy_for(&deployment.service).clone();
                self.start_loop(&deployment.id, policy).await;
            }
        }

        Ok(self.active_loops().await.len())
    }

    /// Reconcile every `interval` until shutdown, then stop all loops.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscale supervisor started");

        loop {
            match self.reconcile().await {
                Ok(active) => debug!(active, "autoscale loops reconciled"),
                Err(e) => error!(error = %e, "autoscale reconcile failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("autoscale supervisor shutting down");
                    break;
                }
            }
        }
        self.stop_all().await;
    }
}
