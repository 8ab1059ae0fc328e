//! In-memory collaborators for tests and local runs.
//!
//! `InMemoryProvisioner` keeps instances and routes in process memory and
//! honours request tokens the way a real provisioner must. `ScriptedMetrics`
//! and `ScriptedProbe` answer from values set by the caller.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use stagehand_state::{DeploymentId, InstanceId, MetricSample, epoch_secs};

use crate::error::ProvisionError;
use crate::provider::{
    Cohort, HealthProbe, InstanceSpec, MetricQuery, MetricsError, MetricsSource, ProbeResult,
    Provisioner, RequestToken, TrafficRoute,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Provisioner call kinds, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateInstances,
    RemoveInstances,
    SwitchTraffic,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInstances => "create_instances",
            Self::RemoveInstances => "remove_instances",
            Self::SwitchTraffic => "switch_traffic",
        }
    }
}

const ALWAYS: u32 = u32::MAX;

#[derive(Default)]
struct ProvisionerState {
    next_id: u64,
    alive: BTreeSet<InstanceId>,
    created: HashMap<RequestToken, Vec<InstanceId>>,
    completed: HashSet<RequestToken>,
    routes: HashMap<DeploymentId, TrafficRoute>,
    history: Vec<TrafficRoute>,
    state_changes: u64,
    failures: HashMap<Operation, u32>,
    calls: HashMap<Operation, u32>,
}

impl ProvisionerState {
    /// Count the call and consume an injected failure, if any.
    fn enter(&mut self, op: Operation) -> Result<(), ProvisionError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != ALWAYS {
                    *remaining -= 1;
                }
                Err(ProvisionError::retryable(op.as_str(), "injected failure"))
            }
            _ => Ok(()),
        }
    }
}

/// Provisioner that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryProvisioner {
    state: Mutex<ProvisionerState>,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with a retryable error.
    pub fn fail_next(&self, op: Operation, times: u32) {
        lock(&self.state).failures.insert(op, times);
    }

    /// Make every call of `op` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: Operation) {
        lock(&self.state).failures.insert(op, ALWAYS);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Start instances outside of any transition, e.g. to seed an existing
    /// deployment.
    pub fn seed_instances(&self, count: u32) -> Vec<InstanceId> {
        let mut state = lock(&self.state);
        (0..count)
            .map(|_| {
                state.next_id += 1;
                let id = format!("i-{:05}", state.next_id);
                state.alive.insert(id.clone());
                id
            })
            .collect()
    }

    pub fn alive_instances(&self) -> Vec<InstanceId> {
        lock(&self.state).alive.iter().cloned().collect()
    }

    pub fn is_alive(&self, id: &str) -> bool {
        lock(&self.state).alive.contains(id)
    }

    /// Current route of a deployment.
    pub fn route(&self, deployment_id: &str) -> Option<TrafficRoute> {
        lock(&self.state).routes.get(deployment_id).cloned()
    }

    /// Every route change applied to a deployment, in order.
    pub fn route_history(&self, deployment_id: &str) -> Vec<TrafficRoute> {
        lock(&self.state)
            .history
            .iter()
            .filter(|r| r.deployment_id == deployment_id)
            .cloned()
            .collect()
    }

    /// Candidate weights of every applied route change, in order.
    pub fn weight_history(&self, deployment_id: &str) -> Vec<u8> {
        self.route_history(deployment_id)
            .iter()
            .map(|r| r.candidate_weight)
            .collect()
    }

    /// Number of observable changes (instances created or removed, routes
    /// changed).
    pub fn state_changes(&self) -> u64 {
        lock(&self.state).state_changes
    }

    /// Number of calls of `op`, including deduplicated and failed ones.
    pub fn calls(&self, op: Operation) -> u32 {
        lock(&self.state).calls.get(&op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Provisioner for InMemoryProvisioner {
    async fn create_instances(
        &self,
        token: &RequestToken,
        spec: &InstanceSpec,
        count: u32,
    ) -> Result<Vec<InstanceId>, ProvisionError> {
        let mut state = lock(&self.state);
        state.enter(Operation::CreateInstances)?;
        if let Some(ids) = state.created.get(token) {
            debug!(deployment = %spec.deployment_id, %token, "create replayed");
            return Ok(ids.clone());
        }

        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            state.next_id += 1;
            let id = format!("i-{:05}", state.next_id);
            state.alive.insert(id.clone());
            ids.push(id);
        }
        if !ids.is_empty() {
            state.state_changes += 1;
        }
        state.created.insert(token.clone(), ids.clone());
        debug!(
            deployment = %spec.deployment_id,
            cohort = %spec.cohort,
            image = %spec.image,
            count,
            "instances created"
        );
        Ok(ids)
    }

    async fn remove_instances(
        &self,
        token: &RequestToken,
        instances: &[InstanceId],
    ) -> Result<(), ProvisionError> {
        let mut state = lock(&self.state);
        state.enter(Operation::RemoveInstances)?;
        if state.completed.contains(token) {
            return Ok(());
        }
        let removed = instances
            .iter()
            .filter(|id| state.alive.remove(id.as_str()))
            .count();
        if removed > 0 {
            state.state_changes += 1;
        }
        state.completed.insert(token.clone());
        debug!(removed, "instances removed");
        Ok(())
    }

    async fn switch_traffic(
        &self,
        token: &RequestToken,
        route: &TrafficRoute,
    ) -> Result<(), ProvisionError> {
        let mut state = lock(&self.state);
        state.enter(Operation::SwitchTraffic)?;
        if state.completed.contains(token) {
            return Ok(());
        }
        if state.routes.get(&route.deployment_id) != Some(route) {
            state
                .routes
                .insert(route.deployment_id.clone(), route.clone());
            state.history.push(route.clone());
            state.state_changes += 1;
            debug!(
                deployment = %route.deployment_id,
                weight = route.candidate_weight,
                "route applied"
            );
        }
        state.completed.insert(token.clone());
        Ok(())
    }
}

type SeriesKey = (DeploymentId, Option<Cohort>, String);

/// Metrics source that answers from caller-provided series.
#[derive(Default)]
pub struct ScriptedMetrics {
    series: Mutex<HashMap<SeriesKey, Vec<f64>>>,
    unavailable: Mutex<bool>,
}

impl ScriptedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the series returned for a deployment/cohort/metric.
    pub fn set(&self, deployment_id: &str, cohort: Option<Cohort>, metric: &str, values: Vec<f64>) {
        lock(&self.series).insert(
            (deployment_id.to_string(), cohort, metric.to_string()),
            values,
        );
    }

    pub fn clear(&self, deployment_id: &str, cohort: Option<Cohort>, metric: &str) {
        lock(&self.series).remove(&(deployment_id.to_string(), cohort, metric.to_string()));
    }

    /// Make every query fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<MetricSample>, MetricsError> {
        if *lock(&self.unavailable) {
            return Err(MetricsError("metrics backend unreachable".to_string()));
        }
        let key = (query.deployment.clone(), query.cohort, query.metric.clone());
        let now = epoch_secs();
        Ok(lock(&self.series)
            .get(&key)
            .map(|values| {
                values
                    .iter()
                    .map(|&value| MetricSample {
                        deployment: query.deployment.clone(),
                        metric: query.metric.clone(),
                        value,
                        timestamp: now,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Health probe that replays a script, then a fixed fallback.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeResult>>,
    fallback: ProbeResult,
    probes: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(script: Vec<ProbeResult>, fallback: ProbeResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            probes: AtomicU32::new(0),
        }
    }

    pub fn healthy() -> Self {
        Self::new(Vec::new(), ProbeResult::Healthy)
    }

    pub fn unhealthy() -> Self {
        Self::new(Vec::new(), ProbeResult::Unhealthy)
    }

    pub fn push(&self, result: ProbeResult) {
        lock(&self.script).push_back(result);
    }

    pub fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedProbe {
    fn default() -> Self {
        Self::healthy()
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _deployment_id: &str, _instances: &[InstanceId]) -> ProbeResult {
        self.probes.fetch_add(1, Ordering::SeqCst);
        lock(&self.script).pop_front().unwrap_or(self.fallback)
    }
}
