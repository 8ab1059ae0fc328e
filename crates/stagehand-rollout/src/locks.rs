//! Per-deployment locks shared by the strategy engine and the autoscaler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

/// The two locks guarding one deployment.
#[derive(Default)]
struct DeploymentSlot {
    /// Held for a whole strategy transition.
    strategy: Arc<AsyncMutex<()>>,
    /// Held by an autoscaler tick while it checks and applies a change, and
    /// by the engine while it enters a state that blocks scaling.
    scaling: Arc<AsyncMutex<()>>,
}

/// Lazily created lock pairs keyed by deployment ID.
#[derive(Clone, Default)]
pub struct DeploymentLocks {
    slots: Arc<Mutex<HashMap<String, DeploymentSlot>>>,
}

impl DeploymentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(&self, deployment_id: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(deployment_id.to_string())
            .or_default()
            .strategy
            .clone()
    }

    pub fn scaling(&self, deployment_id: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(deployment_id.to_string())
            .or_default()
            .scaling
            .clone()
    }
}
