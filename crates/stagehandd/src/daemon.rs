//! Assembles the subsystems into one process.
//!
//! Provisioning, probing and metrics run against the in-process backends
//! from `stagehand-rollout`; a real cloud backend plugs in through the same
//! collaborator traits.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use stagehand_autoscale::AutoscaleSupervisor;
use stagehand_registry::RegistryIndex;
use stagehand_release::{RecoveryReport, ReleaseOrchestrator};
use stagehand_rollout::{
    DeploymentLocks, HealthProbe, InMemoryProvisioner, MetricsSource, Provisioner,
    ScriptedMetrics, ScriptedProbe, StrategyEngine,
};
use stagehand_state::StateStore;

use crate::config::StagehandConfig;

/// Every long-lived component of the daemon.
pub struct Daemon {
    config: StagehandConfig,
    orchestrator: ReleaseOrchestrator,
    supervisor: AutoscaleSupervisor,
}

impl Daemon {
    /// Open the state store and wire the components together.
    pub fn build(config: StagehandConfig) -> anyhow::Result<Self> {
        let data_dir = &config.state.data_dir;
        std::fs::create_dir_all(data_dir)?;
        let store = open_store(data_dir)?;

        let provisioner: Arc<dyn Provisioner> = Arc::new(InMemoryProvisioner::new());
        let probe: Arc<dyn HealthProbe> = Arc::new(ScriptedProbe::healthy());
        let metrics: Arc<dyn MetricsSource> = Arc::new(ScriptedMetrics::new());
        let locks = DeploymentLocks::new();

        let engine = StrategyEngine::new(
            store.clone(),
            provisioner.clone(),
            probe,
            metrics.clone(),
        )
        .with_retry(config.retry)
        .with_locks(locks.clone());

        let orchestrator = ReleaseOrchestrator::new(
            config.pipeline()?,
            config.service_specs(),
            engine,
            RegistryIndex::new(store.clone()),
        )?;

        let mut supervisor = AutoscaleSupervisor::new(
            store,
            provisioner,
            metrics,
            locks,
            config.autoscale.clone(),
        )
        .with_retry(config.retry);
        for service in &config.services {
            if let Some(policy) = &service.autoscale {
                supervisor = supervisor.with_service_policy(&service.name, policy.clone());
            }
        }

        Ok(Self {
            config,
            orchestrator,
            supervisor,
        })
    }

    pub fn orchestrator(&self) -> &ReleaseOrchestrator {
        &self.orchestrator
    }

    pub fn supervisor(&self) -> &AutoscaleSupervisor {
        &self.supervisor
    }

    /// Clean up whatever a previous process left mid-transition.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        let report = self.orchestrator.recover().await?;
        if !report.deployments_degraded.is_empty() {
            warn!(
                deployments = ?report.deployments_degraded,
                "deployments degraded during recovery; resolve them through the API"
            );
        }
        Ok(report)
    }

    /// Recover, start the background loops and serve the API until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        self.recover().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = self.orchestrator.clone();
        let dispatcher_shutdown = shutdown_rx.clone();
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run_dispatcher(dispatcher_shutdown).await;
        });

        let supervisor = self.supervisor;
        let interval = self.config.supervisor.reconcile_interval();
        let supervisor_handle = tokio::spawn(async move {
            supervisor.run(interval, shutdown_rx).await;
        });

        let router = stagehand_api::build_router(self.orchestrator.clone());
        let addr = self.config.server.addr();
        info!(%addr, "API server starting");
        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "cannot listen for Ctrl-C; shutting down");
                }
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            })
            .await?;

        let _ = dispatcher_handle.await;
        let _ = supervisor_handle.await;

        info!("stagehand daemon stopped");
        Ok(())
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    let db_path = data_dir.join("stagehand.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}
