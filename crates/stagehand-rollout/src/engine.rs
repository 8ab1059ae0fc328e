//! Strategy engine — drives a deployment from its active image to a
//! candidate.
//!
//! Every state change is persisted before the engine acts on it, so a
//! restarted daemon can find interrupted transitions and roll them back
//! with the same request tokens the original run used.
//!
//! Blue/green: `Provisioning → TrafficSwitching → Verifying → Committed`.
//! Canary: `Provisioning → (RampUp → Analyzing)* → Committed`.
//! Any failure after provisioning goes through `RollingBack`, which routes
//! all traffic back to the active set before the candidate is removed. If
//! that fails the deployment is left `Degraded`.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use stagehand_state::{
    Deployment, Image, InstanceBounds, StateError, StateResult, StateStore, StrategyState,
    epoch_secs,
};

use crate::analysis::{self, CohortHealth};
use crate::cancel::CancelSignal;
use crate::error::{Interrupted, PromotionError, PromotionResult, VerificationFailure};
use crate::locks::DeploymentLocks;
use crate::provider::{
    Cohort, HealthProbe, InstanceSpec, METRIC_ERROR_RATE, MetricsSource, ProbeResult, Provisioner,
    RequestToken, TrafficRoute,
};
use crate::retry::RetryPolicy;
use crate::strategy::{BlueGreenConfig, CanaryConfig, RolloutStrategy};

/// Why a strategy run stopped short of commit.
enum Stop {
    /// Roll back and report the reason.
    Interrupted(Interrupted),
    /// The store failed; nothing more can be done safely.
    Fatal(PromotionError),
}

impl From<Interrupted> for Stop {
    fn from(i: Interrupted) -> Self {
        Self::Interrupted(i)
    }
}

impl From<VerificationFailure> for Stop {
    fn from(f: VerificationFailure) -> Self {
        Self::Interrupted(f.into())
    }
}

impl From<StateError> for Stop {
    fn from(e: StateError) -> Self {
        Self::Fatal(e.into())
    }
}

/// Runs blue/green and canary transitions against the collaborators.
#[derive(Clone)]
pub struct StrategyEngine {
    store: StateStore,
    provisioner: Arc<dyn Provisioner>,
    probe: Arc<dyn HealthProbe>,
    metrics: Arc<dyn MetricsSource>,
    retry: RetryPolicy,
    locks: DeploymentLocks,
}

impl StrategyEngine {
    pub fn new(
        store: StateStore,
        provisioner: Arc<dyn Provisioner>,
        probe: Arc<dyn HealthProbe>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            store,
            provisioner,
            probe,
            metrics,
            retry: RetryPolicy::default(),
            locks: DeploymentLocks::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share lock pairs with another component (the autoscaler).
    pub fn with_locks(mut self, locks: DeploymentLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn locks(&self) -> &DeploymentLocks {
        &self.locks
    }

    pub fn provisioner(&self) -> &Arc<dyn Provisioner> {
        &self.provisioner
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSource> {
        &self.metrics
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Move `deployment_id` to `candidate` using `strategy`.
    ///
    /// Returns the committed deployment, or an error describing why the
    /// candidate was not committed. `RolledBack` means the active set is
    /// serving all traffic again; `Degraded` means it might not be.
    pub async fn promote(
        &self,
        deployment_id: &str,
        candidate: Image,
        strategy: &RolloutStrategy,
        mut cancel: CancelSignal,
    ) -> PromotionResult<Deployment> {
        strategy.validate()?;

        let lock = self.locks.strategy(deployment_id);
        let _guard = lock.try_lock_owned().map_err(|_| {
            PromotionError::Busy(format!("{deployment_id} has a transition in progress"))
        })?;

        let current = self.load(deployment_id)?;
        if let StrategyState::Degraded { reason } = &current.strategy_state {
            return Err(PromotionError::Degraded {
                reason: format!("{deployment_id} needs operator action: {reason}"),
            });
        }
        if current.strategy_state.in_transition() {
            return Err(PromotionError::Busy(format!(
                "{deployment_id} is {}",
                current.strategy_state
            )));
        }
        if candidate.same_content(&current.active_image) {
            info!(deployment = %deployment_id, image = %candidate, "candidate already active");
            let tag = candidate.tag.clone();
            return Ok(self.store.update_deployment(deployment_id, |d| {
                d.active_image.tag = tag;
                d.strategy_state = StrategyState::Committed;
                Ok(())
            })?);
        }
        if cancel.is_cancelled() {
            return Err(PromotionError::Cancelled);
        }

        info!(
            deployment = %deployment_id,
            from = %current.active_image,
            to = %candidate,
            strategy = strategy.name(),
            "starting transition"
        );
        let started = self.store.update_deployment(deployment_id, |d| {
            d.candidate_image = Some(candidate);
            d.candidate_instances.clear();
            d.candidate_weight = 0;
            d.generation += 1;
            d.strategy_state = StrategyState::Provisioning;
            Ok(())
        })?;

        let outcome = match strategy {
            RolloutStrategy::BlueGreen(cfg) => self.run_blue_green(started, cfg, &mut cancel).await,
            RolloutStrategy::Canary(cfg) => self.run_canary(started, cfg, &mut cancel).await,
        };

        match outcome {
            Ok(()) => self.commit(deployment_id).await,
            Err(Stop::Interrupted(reason)) => Err(self.abandon(deployment_id, reason.to_string()).await),
            Err(Stop::Fatal(e)) => {
                error!(deployment = %deployment_id, error = %e, "transition aborted");
                Err(e)
            }
        }
    }

    /// First release of a service into an environment: start the minimum
    /// instance count, route all traffic to it and record it as committed.
    pub async fn bootstrap(
        &self,
        environment: &str,
        service: &str,
        image: Image,
        bounds: InstanceBounds,
    ) -> PromotionResult<Deployment> {
        if !bounds.is_valid() {
            return Err(PromotionError::Configuration(format!(
                "invalid instance bounds {}..={}",
                bounds.min, bounds.max
            )));
        }
        let id = Deployment::make_id(environment, service);
        let lock = self.locks.strategy(&id);
        let _guard = lock
            .try_lock_owned()
            .map_err(|_| PromotionError::Busy(format!("{id} has a transition in progress")))?;
        if self.store.get_deployment(&id)?.is_some() {
            return Err(PromotionError::Configuration(format!("{id} already exists")));
        }

        let count = bounds.min.max(1);
        let step = format!("bootstrap:{}", epoch_secs());
        let spec = InstanceSpec {
            deployment_id: id.clone(),
            image: image.clone(),
            cohort: Cohort::Baseline,
        };
        let create = RequestToken::derive(&id, &image.digest, "create_instances", &step);
        let instances = self
            .retry
            .run("create_instances", None, || {
                self.provisioner.create_instances(&create, &spec, count)
            })
            .await
            .map_err(provision_failure)?;

        let route = TrafficRoute::stable_only(&id, &instances);
        let switch = RequestToken::derive(&id, &image.digest, "switch_traffic", &step);
        if let Err(e) = self
            .retry
            .run("switch_traffic", None, || {
                self.provisioner.switch_traffic(&switch, &route)
            })
            .await
        {
            let remove = RequestToken::derive(&id, &image.digest, "remove_instances", &step);
            if let Err(cleanup) = self
                .retry
                .run("remove_instances", None, || {
                    self.provisioner.remove_instances(&remove, &instances)
                })
                .await
            {
                warn!(deployment = %id, error = %cleanup, "bootstrap instances not removed");
            }
            return Err(provision_failure(e));
        }

        let mut deployment = Deployment::new(environment, service, image, bounds, instances);
        deployment.strategy_state = StrategyState::Committed;
        self.store.put_deployment(&deployment)?;
        info!(
            deployment = %id,
            image = %deployment.active_image,
            instances = deployment.instance_count,
            "deployment bootstrapped"
        );
        Ok(deployment)
    }

    /// Roll back a transition that was interrupted by a restart. Resting
    /// deployments are returned unchanged.
    pub async fn recover(&self, deployment_id: &str) -> PromotionResult<Deployment> {
        let lock = self.locks.strategy(deployment_id);
        let _guard = lock.lock_owned().await;

        let deployment = self.load(deployment_id)?;
        if !deployment.strategy_state.in_transition() {
            return Ok(deployment);
        }
        warn!(
            deployment = %deployment_id,
            state = %deployment.strategy_state,
            "transition interrupted by restart"
        );

        // The create call may have succeeded without its result being
        // stored. Replaying it with the original token returns that set.
        if deployment.strategy_state == StrategyState::Provisioning
            && deployment.candidate_instances.is_empty()
            && let Some(image) = deployment.candidate_image.clone()
        {
            let spec = InstanceSpec {
                deployment_id: deployment.id.clone(),
                image,
                cohort: Cohort::Candidate,
            };
            let size = deployment.candidate_size();
            let token = token(&deployment, "create_instances", "candidate");
            match self
                .retry
                .run("create_instances", None, || {
                    self.provisioner.create_instances(&token, &spec, size)
                })
                .await
            {
                Ok(instances) => {
                    self.store.update_deployment(deployment_id, |d| {
                        d.candidate_instances = instances;
                        Ok(())
                    })?;
                }
                Err(e) => {
                    warn!(deployment = %deployment_id, error = %e, "could not replay candidate create");
                }
            }
        }

        self.roll_back(deployment_id, "interrupted by restart").await
    }

    /// Retry the rollback of a degraded deployment after an operator has
    /// fixed whatever made it fail.
    pub async fn resolve_degraded(&self, deployment_id: &str) -> PromotionResult<Deployment> {
        let lock = self.locks.strategy(deployment_id);
        let _guard = lock.try_lock_owned().map_err(|_| {
            PromotionError::Busy(format!("{deployment_id} has a transition in progress"))
        })?;

        let deployment = self.load(deployment_id)?;
        let StrategyState::Degraded { reason } = &deployment.strategy_state else {
            return Err(PromotionError::Configuration(format!(
                "{deployment_id} is {}, not degraded",
                deployment.strategy_state
            )));
        };
        info!(deployment = %deployment_id, %reason, "resolving degraded deployment");
        self.roll_back(deployment_id, &format!("resolved by operator after: {reason}"))
            .await
    }

    // ── Blue/green ────────────────────────────────────────────────

    async fn run_blue_green(
        &self,
        deployment: Deployment,
        cfg: &BlueGreenConfig,
        cancel: &mut CancelSignal,
    ) -> Result<(), Stop> {
        let id = deployment.id.clone();
        self.provision_candidate(&deployment, cancel).await?;
        if cancel.is_cancelled() {
            return Err(Interrupted::Cancelled.into());
        }

        let switching = self.set_state(&id, StrategyState::TrafficSwitching).await?;
        let switched = self.route_candidate(&switching, 100).await?;
        info!(deployment = %id, "traffic switched to candidate");

        self.verify(&switched, cfg, cancel).await?;
        Ok(())
    }

    async fn verify(
        &self,
        deployment: &Deployment,
        cfg: &BlueGreenConfig,
        cancel: &mut CancelSignal,
    ) -> Result<(), Stop> {
        let id = deployment.id.as_str();
        let required = cfg.required_probes;
        let deadline = Instant::now() + cfg.max_wait();
        let mut passed = 0;
        self.set_state(id, StrategyState::Verifying { probes_passed: 0 })
            .await?;

        while passed < required {
            let next = Instant::now() + cfg.probe_interval();
            if next > deadline {
                return Err(VerificationFailure::Timeout { passed, required }.into());
            }
            if !cancel.sleep_until(next).await {
                return Err(Interrupted::Cancelled.into());
            }

            let probe = self.probe.probe(id, &deployment.candidate_instances);
            let Ok(result) = tokio::time::timeout_at(deadline, probe).await else {
                return Err(VerificationFailure::Timeout { passed, required }.into());
            };
            if result != ProbeResult::Healthy {
                warn!(deployment = %id, ?result, passed, "verification probe failed");
                return Err(VerificationFailure::ProbeFailed { passed }.into());
            }

            passed += 1;
            self.set_state(id, StrategyState::Verifying { probes_passed: passed })
                .await?;
            debug!(deployment = %id, passed, required, "verification probe healthy");
        }
        Ok(())
    }

    // ── Canary ────────────────────────────────────────────────────

    async fn run_canary(
        &self,
        deployment: Deployment,
        cfg: &CanaryConfig,
        cancel: &mut CancelSignal,
    ) -> Result<(), Stop> {
        let id = deployment.id.clone();
        self.provision_candidate(&deployment, cancel).await?;

        let window = cfg.analysis_window();
        let mut baseline: Option<CohortHealth> = None;
        for (step, &weight) in cfg.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Interrupted::Cancelled.into());
            }

            let ramping = self
                .set_state(&id, StrategyState::RampUp { step, weight })
                .await?;
            self.route_candidate(&ramping, weight).await?;
            self.set_state(&id, StrategyState::Analyzing { step, weight })
                .await?;
            info!(deployment = %id, step, weight, "canary step holding");

            if !cancel.sleep(window).await {
                return Err(Interrupted::Cancelled.into());
            }

            let metrics = self.metrics.as_ref();
            let candidate =
                CohortHealth::observe(metrics, &id, Cohort::Candidate, window, weight).await?;
            if weight < 100 {
                baseline =
                    Some(CohortHealth::observe(metrics, &id, Cohort::Baseline, window, weight).await?);
            }
            let Some(reference) = baseline.as_ref() else {
                return Err(VerificationFailure::MissingData {
                    cohort: Cohort::Baseline,
                    metric: METRIC_ERROR_RATE.to_string(),
                    weight,
                }
                .into());
            };
            analysis::judge(cfg, &candidate, reference, weight)?;
        }
        Ok(())
    }

    // ── Shared steps ──────────────────────────────────────────────

    async fn provision_candidate(
        &self,
        deployment: &Deployment,
        cancel: &mut CancelSignal,
    ) -> Result<Deployment, Stop> {
        let Some(image) = deployment.candidate_image.clone() else {
            return Err(Stop::Fatal(PromotionError::Configuration(format!(
                "{} has no candidate image",
                deployment.id
            ))));
        };
        let size = deployment.candidate_size();
        let spec = InstanceSpec {
            deployment_id: deployment.id.clone(),
            image,
            cohort: Cohort::Candidate,
        };
        let token = token(deployment, "create_instances", "candidate");
        let instances = self
            .retry
            .run("create_instances", Some(cancel), || {
                self.provisioner.create_instances(&token, &spec, size)
            })
            .await?;
        debug!(deployment = %deployment.id, count = instances.len(), "candidate set provisioned");

        Ok(self.store.update_deployment(&deployment.id, |d| {
            d.candidate_instances = instances;
            Ok(())
        })?)
    }

    /// Point `weight` percent of traffic at the candidate set. Not
    /// cancellable: a route change always finishes or fails.
    async fn route_candidate(&self, deployment: &Deployment, weight: u8) -> Result<Deployment, Stop> {
        let route = TrafficRoute::split(
            &deployment.id,
            &deployment.active_instances,
            &deployment.candidate_instances,
            weight,
        );
        let token = token(deployment, "switch_traffic", &format!("candidate:{weight}"));
        self.retry
            .run("switch_traffic", None, || {
                self.provisioner.switch_traffic(&token, &route)
            })
            .await?;
        Ok(self.store.update_deployment(&deployment.id, |d| {
            d.candidate_weight = weight;
            Ok(())
        })?)
    }

    /// Persist a new strategy state. States that block scaling are entered
    /// under the scaling lock, so an autoscaler tick that already checked
    /// the state finishes before traffic moves.
    async fn set_state(&self, deployment_id: &str, state: StrategyState) -> StateResult<Deployment> {
        let _scaling = if state.blocks_scaling() {
            Some(self.locks.scaling(deployment_id).lock_owned().await)
        } else {
            None
        };
        self.store.update_deployment(deployment_id, |d| {
            d.strategy_state = state;
            Ok(())
        })
    }

    async fn commit(&self, deployment_id: &str) -> PromotionResult<Deployment> {
        let mut previous = Vec::new();
        let committed = self.store.update_deployment(deployment_id, |d| {
            let Some(candidate) = d.candidate_image.take() else {
                return Err(StateError::InvalidTransition(format!(
                    "{deployment_id} has no candidate to commit"
                )));
            };
            let promoted = std::mem::take(&mut d.candidate_instances);
            previous = std::mem::replace(&mut d.active_instances, promoted);
            d.active_image = candidate;
            d.candidate_weight = 0;
            d.instance_count = d.active_instances.len() as u32;
            d.desired_instance_count = d.instances.clamp(d.instance_count);
            d.strategy_state = StrategyState::Committed;
            Ok(())
        })?;

        let route = TrafficRoute::stable_only(deployment_id, &committed.active_instances);
        let normalize = token(&committed, "switch_traffic", "normalize");
        if let Err(e) = self
            .retry
            .run("switch_traffic", None, || {
                self.provisioner.switch_traffic(&normalize, &route)
            })
            .await
        {
            warn!(deployment = %deployment_id, error = %e, "route not normalised after commit");
        }

        if !previous.is_empty() {
            let remove = token(&committed, "remove_instances", "previous");
            if let Err(e) = self
                .retry
                .run("remove_instances", None, || {
                    self.provisioner.remove_instances(&remove, &previous)
                })
                .await
            {
                warn!(
                    deployment = %deployment_id,
                    error = %e,
                    orphaned = previous.len(),
                    "previous instance set not removed"
                );
            }
        }

        info!(
            deployment = %deployment_id,
            image = %committed.active_image,
            instances = committed.instance_count,
            "transition committed"
        );
        Ok(committed)
    }

    async fn abandon(&self, deployment_id: &str, reason: String) -> PromotionError {
        match self.roll_back(deployment_id, &reason).await {
            Ok(_) => PromotionError::RolledBack { reason },
            Err(e) => e,
        }
    }

    /// Return all traffic to the active set and remove the candidate set.
    async fn roll_back(&self, deployment_id: &str, reason: &str) -> PromotionResult<Deployment> {
        let before = self.load(deployment_id)?;
        let traffic_moved = before.strategy_state != StrategyState::Provisioning;
        let deployment = self
            .set_state(deployment_id, StrategyState::RollingBack)
            .await?;
        warn!(deployment = %deployment_id, %reason, traffic_moved, "rolling back");

        if traffic_moved {
            let route = TrafficRoute::stable_only(deployment_id, &deployment.active_instances);
            let switch = token(&deployment, "switch_traffic", "rollback");
            if let Err(e) = self
                .retry
                .run("switch_traffic", None, || {
                    self.provisioner.switch_traffic(&switch, &route)
                })
                .await
            {
                return Err(self
                    .degrade(deployment_id, format!("rollback route failed ({e}) after: {reason}"))
                    .await);
            }
            self.store.update_deployment(deployment_id, |d| {
                d.candidate_weight = 0;
                Ok(())
            })?;
        }

        if !deployment.candidate_instances.is_empty() {
            let remove = token(&deployment, "remove_instances", "candidate");
            if let Err(e) = self
                .retry
                .run("remove_instances", None, || {
                    self.provisioner
                        .remove_instances(&remove, &deployment.candidate_instances)
                })
                .await
            {
                return Err(self
                    .degrade(
                        deployment_id,
                        format!("candidate set not removed ({e}) after: {reason}"),
                    )
                    .await);
            }
        }

        let rolled_back = self.store.update_deployment(deployment_id, |d| {
            d.candidate_image = None;
            d.candidate_instances.clear();
            d.candidate_weight = 0;
            d.strategy_state = StrategyState::RolledBack {
                reason: reason.to_string(),
            };
            Ok(())
        })?;
        info!(deployment = %deployment_id, image = %rolled_back.active_image, "rolled back");
        Ok(rolled_back)
    }

    async fn degrade(&self, deployment_id: &str, reason: String) -> PromotionError {
        error!(deployment = %deployment_id, %reason, "rollback failed, deployment degraded");
        let state = StrategyState::Degraded {
            reason: reason.clone(),
        };
        match self.set_state(deployment_id, state).await {
            Ok(_) => PromotionError::Degraded { reason },
            Err(e) => PromotionError::State(e),
        }
    }

    fn load(&self, deployment_id: &str) -> PromotionResult<Deployment> {
        self.store
            .get_deployment(deployment_id)?
            .ok_or_else(|| PromotionError::UnknownDeployment(deployment_id.to_string()))
    }
}

/// Token for a transition step. The generation keeps tokens of separate
/// transitions of the same digest apart.
fn token(deployment: &Deployment, operation: &str, step: &str) -> RequestToken {
    let digest = deployment
        .candidate_image
        .as_ref()
        .unwrap_or(&deployment.active_image)
        .digest
        .as_str();
    RequestToken::derive(
        &deployment.id,
        digest,
        operation,
        &format!("{}:{step}", deployment.generation),
    )
}

fn provision_failure(interrupted: Interrupted) -> PromotionError {
    match interrupted {
        Interrupted::Provision(e) => PromotionError::Provision(e),
        Interrupted::Cancelled => PromotionError::Cancelled,
        Interrupted::Verification(f) => PromotionError::RolledBack {
            reason: f.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::watch;

    use super::*;
    use crate::memory::{InMemoryProvisioner, Operation, ScriptedMetrics, ScriptedProbe};
    use crate::provider::METRIC_P99_LATENCY_MS;

    fn image(c: char, tag: &str) -> Image {
        Image::new("registry.local/api", tag, &format!("sha256:{}", c.to_string().repeat(64)))
    }

    struct Fixture {
        engine: StrategyEngine,
        store: StateStore,
        provisioner: Arc<InMemoryProvisioner>,
        probe: Arc<ScriptedProbe>,
        metrics: Arc<ScriptedMetrics>,
    }

    impl Fixture {
        fn new(probe: ScriptedProbe) -> Self {
            let store = StateStore::open_in_memory().unwrap();
            let provisioner = Arc::new(InMemoryProvisioner::new());
            let probe = Arc::new(probe);
            let metrics = Arc::new(ScriptedMetrics::new());
            let engine = StrategyEngine::new(
                store.clone(),
                provisioner.clone(),
                probe.clone(),
                metrics.clone(),
            );
            Self {
                engine,
                store,
                provisioner,
                probe,
                metrics,
            }
        }

        /// Existing `{env}/api` deployment running v1 on three instances.
        fn seed(&self, env: &str) -> Deployment {
            let instances = self.provisioner.seed_instances(3);
            let deployment = Deployment::new(
                env,
                "api",
                image('a', "v1"),
                InstanceBounds::new(1, 10),
                instances,
            );
            self.store.put_deployment(&deployment).unwrap();
            deployment
        }

        fn healthy_cohorts(&self, deployment_id: &str) {
            for cohort in [Cohort::Baseline, Cohort::Candidate] {
                self.metrics
                    .set(deployment_id, Some(cohort), METRIC_ERROR_RATE, vec![0.01]);
                self.metrics
                    .set(deployment_id, Some(cohort), METRIC_P99_LATENCY_MS, vec![120.0]);
            }
        }

        fn get(&self, id: &str) -> Deployment {
            self.store.get_deployment(id).unwrap().unwrap()
        }
    }

    fn blue_green() -> RolloutStrategy {
        RolloutStrategy::BlueGreen(BlueGreenConfig::default())
    }

    fn canary() -> RolloutStrategy {
        RolloutStrategy::Canary(CanaryConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn blue_green_commits_after_required_probes() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        let seeded = fx.seed("dev");

        let committed = fx
            .engine
            .promote("dev/api", image('b', "v2"), &blue_green(), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(committed.strategy_state, StrategyState::Committed);
        assert_eq!(committed.active_image.digest, image('b', "v2").digest);
        assert!(committed.candidate_image.is_none());
        assert_eq!(committed.instance_count, 3);
        assert_eq!(fx.probe.probe_count(), 6);

        for old in &seeded.active_instances {
            assert!(!fx.provisioner.is_alive(old));
        }
        let route = fx.provisioner.route("dev/api").unwrap();
        assert_eq!(route.stable, committed.active_instances);
        assert_eq!(route.candidate_weight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blue_green_probe_failure_switches_back_before_rollback() {
        let fx = Fixture::new(ScriptedProbe::new(
            vec![ProbeResult::Healthy, ProbeResult::Unhealthy],
            ProbeResult::Healthy,
        ));
        let seeded = fx.seed("dev");

        let err = fx
            .engine
            .promote("dev/api", image('b', "v2"), &blue_green(), CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::RolledBack { .. }), "{err}");

        let dep = fx.get("dev/api");
        assert!(matches!(dep.strategy_state, StrategyState::RolledBack { .. }));
        assert_eq!(dep.active_image.digest, seeded.active_image.digest);
        assert!(dep.candidate_image.is_none());
        assert!(dep.candidate_instances.is_empty());

        // Full cutover, then one change straight back to the old set.
        assert_eq!(fx.provisioner.weight_history("dev/api"), vec![100, 0]);
        let route = fx.provisioner.route("dev/api").unwrap();
        assert_eq!(route.stable, seeded.active_instances);
        assert_eq!(fx.provisioner.alive_instances(), seeded.active_instances);
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_failure_never_touches_traffic() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        let seeded = fx.seed("dev");
        fx.provisioner.fail_always(Operation::CreateInstances);

        let err = fx
            .engine
            .promote("dev/api", image('b', "v2"), &blue_green(), CancelSignal::never())
            .await
            .unwrap_err();
        match err {
            PromotionError::RolledBack { reason } => assert!(reason.contains("create_instances")),
            other => panic!("expected rollback, got {other}"),
        }
        assert_eq!(fx.provisioner.calls(Operation::CreateInstances), 5);
        assert_eq!(fx.provisioner.calls(Operation::SwitchTraffic), 0);
        assert_eq!(fx.get("dev/api").active_instances, seeded.active_instances);
    }

    #[tokio::test(start_paused = true)]
    async fn canary_commits_through_all_steps() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        fx.seed("staging");
        fx.healthy_cohorts("staging/api");

        let committed = fx
            .engine
            .promote("staging/api", image('b', "v2"), &canary(), CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(committed.strategy_state, StrategyState::Committed);

        let weights = fx.provisioner.weight_history("staging/api");
        assert_eq!(&weights[..4], &[5, 25, 50, 100]);
        let last = fx.provisioner.route_history("staging/api").pop().unwrap();
        assert_eq!(last.stable, committed.active_instances);
        assert!(last.candidate.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn canary_regression_drops_to_zero_in_one_change() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        let seeded = fx.seed("staging");
        fx.healthy_cohorts("staging/api");

        // Steps are analysed at t=60, 120, 180; degrade before the third.
        let metrics = fx.metrics.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(150)).await;
            metrics.set("staging/api", Some(Cohort::Candidate), METRIC_ERROR_RATE, vec![0.05]);
        });

        let err = fx
            .engine
            .promote("staging/api", image('b', "v2"), &canary(), CancelSignal::never())
            .await
            .unwrap_err();
        match err {
            PromotionError::RolledBack { reason } => assert!(reason.contains("at 50%"), "{reason}"),
            other => panic!("expected rollback, got {other}"),
        }

        assert_eq!(fx.provisioner.weight_history("staging/api"), vec![5, 25, 50, 0]);
        let route = fx.provisioner.route("staging/api").unwrap();
        assert_eq!(route.stable, seeded.active_instances);
    }

    #[tokio::test(start_paused = true)]
    async fn canary_without_baseline_is_unhealthy() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        fx.seed("staging");
        fx.metrics
            .set("staging/api", Some(Cohort::Candidate), METRIC_ERROR_RATE, vec![0.0]);
        fx.metrics
            .set("staging/api", Some(Cohort::Candidate), METRIC_P99_LATENCY_MS, vec![50.0]);

        let err = fx
            .engine
            .promote("staging/api", image('b', "v2"), &canary(), CancelSignal::never())
            .await
            .unwrap_err();
        match err {
            PromotionError::RolledBack { reason } => assert!(reason.contains("baseline"), "{reason}"),
            other => panic!("expected rollback, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rollback_leaves_deployment_degraded() {
        let fx = Fixture::new(ScriptedProbe::unhealthy());
        let seeded = fx.seed("dev");

        // Cutover at t=0 succeeds; the router breaks before the first probe.
        let provisioner = fx.provisioner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            provisioner.fail_always(Operation::SwitchTraffic);
        });

        let err = fx
            .engine
            .promote("dev/api", image('b', "v2"), &blue_green(), CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::Degraded { .. }), "{err}");
        assert!(fx.get("dev/api").strategy_state.is_degraded());

        let again = fx
            .engine
            .promote("dev/api", image('c', "v3"), &blue_green(), CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(again, PromotionError::Degraded { .. }));

        fx.provisioner.clear_failures();
        let resolved = fx.engine.resolve_degraded("dev/api").await.unwrap();
        assert!(matches!(resolved.strategy_state, StrategyState::RolledBack { .. }));
        assert_eq!(fx.provisioner.route("dev/api").unwrap().stable, seeded.active_instances);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_verification_rolls_back() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        let seeded = fx.seed("dev");
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            let _ = tx.send(true);
        });

        let err = fx
            .engine
            .promote("dev/api", image('b', "v2"), &blue_green(), CancelSignal::new(rx))
            .await
            .unwrap_err();
        match err {
            PromotionError::RolledBack { reason } => assert_eq!(reason, "cancelled"),
            other => panic!("expected rollback, got {other}"),
        }
        assert_eq!(fx.probe.probe_count(), 2);
        assert_eq!(fx.provisioner.route("dev/api").unwrap().stable, seeded.active_instances);
    }

    #[tokio::test]
    async fn cancelled_before_start_changes_nothing() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        fx.seed("dev");
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = fx
            .engine
            .promote("dev/api", image('b', "v2"), &blue_green(), CancelSignal::new(rx))
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::Cancelled));
        assert_eq!(fx.get("dev/api").strategy_state, StrategyState::Idle);
        assert_eq!(fx.provisioner.state_changes(), 0);
    }

    #[tokio::test]
    async fn invalid_strategy_rejected_before_mutation() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        fx.seed("staging");
        let bad = RolloutStrategy::Canary(CanaryConfig {
            steps: vec![50, 25],
            ..Default::default()
        });

        let err = fx
            .engine
            .promote("staging/api", image('b', "v2"), &bad, CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::Configuration(_)));
        assert_eq!(fx.get("staging/api").generation, 0);
    }

    #[tokio::test]
    async fn same_digest_is_a_noop_commit() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        fx.seed("dev");
        let dep = fx
            .engine
            .promote("dev/api", image('a', "v1-retag"), &blue_green(), CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(dep.strategy_state, StrategyState::Committed);
        assert_eq!(dep.active_image.tag, "v1-retag");
        assert_eq!(fx.provisioner.state_changes(), 0);
    }

    #[tokio::test]
    async fn unknown_deployment() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        let err = fx
            .engine
            .promote("dev/nope", image('b', "v2"), &blue_green(), CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::UnknownDeployment(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cutover_waits_for_scaling_lock() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        fx.seed("dev");
        let scaling = fx.engine.locks().scaling("dev/api");
        let held = scaling.clone().lock_owned().await;

        let engine = fx.engine.clone();
        let run = tokio::spawn(async move {
            engine
                .promote("dev/api", image('b', "v2"), &blue_green(), CancelSignal::never())
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.get("dev/api").strategy_state, StrategyState::Provisioning);
        assert_eq!(fx.provisioner.calls(Operation::SwitchTraffic), 0);

        drop(held);
        let committed = run.await.unwrap().unwrap();
        assert_eq!(committed.strategy_state, StrategyState::Committed);
    }

    #[tokio::test]
    async fn concurrent_transition_is_busy() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        fx.seed("dev");
        let _held = fx.engine.locks().strategy("dev/api").try_lock_owned().unwrap();
        let err = fx
            .engine
            .promote("dev/api", image('b', "v2"), &blue_green(), CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::Busy(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn recover_rolls_back_interrupted_transition() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        let seeded = fx.seed("dev");
        let candidate = fx.provisioner.seed_instances(3);
        fx.store
            .update_deployment("dev/api", |d| {
                d.candidate_image = Some(image('b', "v2"));
                d.candidate_instances = candidate.clone();
                d.candidate_weight = 100;
                d.generation = 1;
                d.strategy_state = StrategyState::Verifying { probes_passed: 2 };
                Ok(())
            })
            .unwrap();

        let recovered = fx.engine.recover("dev/api").await.unwrap();
        assert_eq!(
            recovered.strategy_state,
            StrategyState::RolledBack {
                reason: "interrupted by restart".to_string()
            }
        );
        for id in &candidate {
            assert!(!fx.provisioner.is_alive(id));
        }
        assert_eq!(fx.provisioner.route("dev/api").unwrap().stable, seeded.active_instances);

        // Resting deployments are left alone.
        let again = fx.engine.recover("dev/api").await.unwrap();
        assert_eq!(again.strategy_state, recovered.strategy_state);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_replays_unrecorded_create() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        fx.seed("dev");
        fx.store
            .update_deployment("dev/api", |d| {
                d.candidate_image = Some(image('b', "v2"));
                d.generation = 1;
                d.strategy_state = StrategyState::Provisioning;
                Ok(())
            })
            .unwrap();

        let recovered = fx.engine.recover("dev/api").await.unwrap();
        assert!(matches!(recovered.strategy_state, StrategyState::RolledBack { .. }));
        // Replayed set was created and removed again; traffic never moved.
        assert_eq!(fx.provisioner.alive_instances().len(), 3);
        assert!(fx.provisioner.route("dev/api").is_none());
    }

    #[tokio::test]
    async fn bootstrap_starts_minimum_and_routes() {
        let fx = Fixture::new(ScriptedProbe::healthy());
        let dep = fx
            .engine
            .bootstrap("dev", "api", image('a', "v1"), InstanceBounds::new(2, 6))
            .await
            .unwrap();
        assert_eq!(dep.id, "dev/api");
        assert_eq!(dep.instance_count, 2);
        assert_eq!(dep.strategy_state, StrategyState::Committed);
        assert_eq!(fx.provisioner.route("dev/api").unwrap().stable, dep.active_instances);

        let err = fx
            .engine
            .bootstrap("dev", "api", image('a', "v1"), InstanceBounds::new(2, 6))
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::Configuration(_)));
    }
}
