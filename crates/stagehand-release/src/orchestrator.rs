//! Release orchestrator — sequences promotions of an image through the
//! pipeline's environments.
//!
//! Pushed images arrive through [`ReleaseOrchestrator::on_image_pushed`] and
//! are queued for the dispatcher, which starts one [`PromotionRun`] per
//! request. Runs for the same service are serialized by the service lock;
//! runs for different services proceed concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use stagehand_registry::RegistryIndex;
use stagehand_rollout::{CancelSignal, StrategyEngine};
use stagehand_state::{Deployment, Image, PromotionOutcome, PromotionRecord, StateStore};

use crate::approval::ApprovalGate;
use crate::environment::{Pipeline, ServiceSpec};
use crate::error::{ReleaseError, ReleaseResult};
use crate::locks::ServiceLocks;
use crate::run::PromotionRun;

/// Pending pushes the dispatcher has not picked up yet.
const TRIGGER_QUEUE_CAPACITY: usize = 64;

/// Caller choices for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionOptions {
    /// Keep going after a failed or rolled-back environment.
    #[serde(default)]
    pub force: bool,
}

/// A queued promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRequest {
    pub service: String,
    pub image: Image,
    #[serde(default)]
    pub options: PromotionOptions,
}

/// What startup recovery cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Deployments rolled back out of an interrupted transition.
    pub deployments_rolled_back: Vec<String>,
    /// Deployments whose rollback failed and are now degraded.
    pub deployments_degraded: Vec<String>,
    /// Pending records closed as failed.
    pub promotions_closed: Vec<String>,
}

struct Inner {
    pipeline: Pipeline,
    services: HashMap<String, ServiceSpec>,
    engine: StrategyEngine,
    registry: RegistryIndex,
    approvals: ApprovalGate,
    locks: ServiceLocks,
    /// service → (run id, cancel sender) of the run holding the service.
    cancels: Mutex<HashMap<String, (u64, watch::Sender<bool>)>>,
    next_run: AtomicU64,
    trigger_tx: mpsc::Sender<PromotionRequest>,
    trigger_rx: AsyncMutex<Option<mpsc::Receiver<PromotionRequest>>>,
}

/// Top-level coordinator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ReleaseOrchestrator {
    inner: Arc<Inner>,
}

impl ReleaseOrchestrator {
    pub fn new(
        pipeline: Pipeline,
        services: Vec<ServiceSpec>,
        engine: StrategyEngine,
        registry: RegistryIndex,
    ) -> ReleaseResult<Self> {
        let mut by_name = HashMap::new();
        for spec in services {
            spec.validate()?;
            if by_name
                .values()
                .any(|s: &ServiceSpec| s.repository == spec.repository)
            {
                return Err(ReleaseError::Configuration(format!(
                    "repository {} is used by more than one service",
                    spec.repository
                )));
            }
            if by_name.contains_key(&spec.name) {
                return Err(ReleaseError::Configuration(format!(
                    "duplicate service {}",
                    spec.name
                )));
            }
            by_name.insert(spec.name.clone(), spec);
        }

        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                pipeline,
                services: by_name,
                engine,
                registry,
                approvals: ApprovalGate::new(),
                locks: ServiceLocks::new(),
                cancels: Mutex::new(HashMap::new()),
                next_run: AtomicU64::new(1),
                trigger_tx,
                trigger_rx: AsyncMutex::new(Some(trigger_rx)),
            }),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn engine(&self) -> &StrategyEngine {
        &self.inner.engine
    }

    pub fn registry(&self) -> &RegistryIndex {
        &self.inner.registry
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.inner.approvals
    }

    pub fn store(&self) -> &StateStore {
        self.inner.engine.store()
    }

    pub fn service(&self, name: &str) -> ReleaseResult<&ServiceSpec> {
        self.inner
            .services
            .get(name)
            .ok_or_else(|| ReleaseError::UnknownService(name.to_string()))
    }

    /// Configured services, sorted by name.
    pub fn services(&self) -> Vec<&ServiceSpec> {
        let mut services: Vec<_> = self.inner.services.values().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub fn service_for_repository(&self, repository: &str) -> ReleaseResult<&ServiceSpec> {
        self.inner
            .services
            .values()
            .find(|s| s.repository == repository)
            .ok_or_else(|| {
                ReleaseError::UnknownService(format!("no service releases {repository}"))
            })
    }

    // ── Runs ──────────────────────────────────────────────────────

    /// Start a run for the service that releases `image.repository`.
    /// Waits for any run already holding that service.
    pub async fn promote(
        &self,
        image: Image,
        options: PromotionOptions,
    ) -> ReleaseResult<PromotionRun> {
        let service = self.service_for_repository(&image.repository)?.name.clone();
        self.promote_service(&service, image, options).await
    }

    pub async fn promote_service(
        &self,
        service: &str,
        image: Image,
        options: PromotionOptions,
    ) -> ReleaseResult<PromotionRun> {
        let spec = self.service(service)?.clone();
        // Index the image so a committed environment can be recorded on it.
        let image = self
            .inner
            .registry
            .register(&image.repository, &image.tag, &image.digest)?;

        if self.inner.locks.is_held(service) {
            info!(%service, image = %image, "promotion queued behind running release");
        }
        let guard = self.inner.locks.acquire(service).await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        self.cancels().insert(service.to_string(), (run_id, cancel_tx));

        info!(%service, image = %image, run = run_id, force = options.force, "promotion run started");
        Ok(PromotionRun::new(
            self.clone(),
            run_id,
            spec,
            image,
            options,
            CancelSignal::new(cancel_rx),
            guard,
        ))
    }

    /// Cancel the run currently holding `service`. Returns false if there
    /// is none.
    pub fn cancel(&self, service: &str) -> bool {
        match self.cancels().get(service) {
            Some((run_id, tx)) => {
                info!(%service, run = run_id, "promotion cancel requested");
                tx.send(true).is_ok()
            }
            None => false,
        }
    }

    pub(crate) fn release_run(&self, service: &str, run_id: u64) {
        let mut cancels = self.cancels();
        if cancels.get(service).is_some_and(|(id, _)| *id == run_id) {
            cancels.remove(service);
        }
    }

    fn cancels(&self) -> MutexGuard<'_, HashMap<String, (u64, watch::Sender<bool>)>> {
        self.inner.cancels.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Trigger queue ─────────────────────────────────────────────

    /// Index a pushed image and queue a promotion for the service that
    /// releases its repository.
    pub async fn on_image_pushed(
        &self,
        repository: &str,
        tag: &str,
        digest: &str,
    ) -> ReleaseResult<PromotionRequest> {
        let service = self.service_for_repository(repository)?.name.clone();
        let image = self.inner.registry.register(repository, tag, digest)?;
        let request = PromotionRequest {
            service,
            image,
            options: PromotionOptions::default(),
        };
        self.inner
            .trigger_tx
            .send(request.clone())
            .await
            .map_err(|_| ReleaseError::QueueClosed)?;
        info!(service = %request.service, image = %request.image, "promotion queued");
        Ok(request)
    }

    /// Queue an explicit request (API-triggered promotions).
    pub async fn enqueue(&self, request: PromotionRequest) -> ReleaseResult<()> {
        self.service(&request.service)?;
        self.inner
            .trigger_tx
            .send(request)
            .await
            .map_err(|_| ReleaseError::QueueClosed)
    }

    /// Start a run for each queued request until shutdown. Only one
    /// dispatcher can own the queue.
    pub async fn run_dispatcher(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut rx) = self.inner.trigger_rx.lock().await.take() else {
            warn!("promotion dispatcher already running");
            return;
        };
        info!("promotion dispatcher started");

        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    let orchestrator = self.clone();
                    tokio::spawn(async move { orchestrator.drive(request).await });
                }
                _ = shutdown.changed() => {
                    info!("promotion dispatcher shutting down");
                    break;
                }
            }
        }
        *self.inner.trigger_rx.lock().await = Some(rx);
    }

    async fn drive(&self, request: PromotionRequest) {
        let run = match self
            .promote_service(&request.service, request.image, request.options)
            .await
        {
            Ok(run) => run,
            Err(e) => {
                error!(service = %request.service, error = %e, "promotion could not start");
                return;
            }
        };
        match run.collect_all().await {
            Ok(records) => {
                let outcomes: Vec<String> = records
                    .iter()
                    .map(|r| format!("{}={}", r.to_env, r.outcome))
                    .collect();
                info!(service = %request.service, outcomes = ?outcomes, "promotion run finished");
            }
            Err(e) => warn!(service = %request.service, error = %e, "promotion run stopped"),
        }
    }

    // ── Status / audit ────────────────────────────────────────────

    pub fn list_promotions(&self, service: &str) -> ReleaseResult<Vec<PromotionRecord>> {
        Ok(self.store().list_promotions(service)?)
    }

    pub fn get_promotion(&self, id: &str) -> ReleaseResult<Option<PromotionRecord>> {
        Ok(self.store().get_promotion(id)?)
    }

    pub fn get_deployment(
        &self,
        environment: &str,
        service: &str,
    ) -> ReleaseResult<Option<Deployment>> {
        Ok(self
            .store()
            .get_deployment(&Deployment::make_id(environment, service))?)
    }

    pub fn list_deployments(&self) -> ReleaseResult<Vec<Deployment>> {
        Ok(self.store().list_deployments()?)
    }

    /// Retry the rollback of a degraded deployment.
    pub async fn resolve_degraded(
        &self,
        environment: &str,
        service: &str,
    ) -> ReleaseResult<Deployment> {
        if self.pipeline().get(environment).is_none() {
            return Err(ReleaseError::UnknownEnvironment(environment.to_string()));
        }
        let id = Deployment::make_id(environment, service);
        Ok(self.inner.engine.resolve_degraded(&id).await?)
    }

    // ── Recovery ──────────────────────────────────────────────────

    /// Startup cleanup: roll back transitions interrupted by a restart and
    /// close records that were pending when the process stopped.
    pub async fn recover(&self) -> ReleaseResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for deployment in self.store().list_deployments()? {
            if !deployment.strategy_state.in_transition() {
                continue;
            }
            match self.inner.engine.recover(&deployment.id).await {
                Ok(_) => report.deployments_rolled_back.push(deployment.id),
                Err(e) => {
                    error!(deployment = %deployment.id, error = %e, "recovery rollback failed");
                    report.deployments_degraded.push(deployment.id);
                }
            }
        }

        for record in self.store().list_pending_promotions()? {
            self.store()
                .complete_promotion(&record.id, PromotionOutcome::Failed, "interrupted by restart")?;
            debug!(promotion = %record.id, "pending promotion closed");
            report.promotions_closed.push(record.id);
        }

        info!(
            rolled_back = report.deployments_rolled_back.len(),
            degraded = report.deployments_degraded.len(),
            closed = report.promotions_closed.len(),
            "recovery complete"
        );
        Ok(report)
    }
}
