//! Environments, the ordered pipeline they form, and the services released
//! through it.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stagehand_rollout::RolloutStrategy;
use stagehand_state::InstanceBounds;

use crate::error::{ReleaseError, ReleaseResult};

/// One stage of the pipeline (dev, staging, production).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    /// Position in the pipeline; lower runs first.
    pub order: u32,
    #[serde(default)]
    pub strategy: RolloutStrategy,
    #[serde(default)]
    pub approval_required: bool,
    /// Give up waiting for approval after this long. No limit when unset.
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,
}

impl Environment {
    pub fn new(name: &str, order: u32, strategy: RolloutStrategy) -> Self {
        Self {
            name: name.to_string(),
            order,
            strategy,
            approval_required: false,
            approval_timeout_secs: None,
        }
    }

    pub fn with_approval(mut self, timeout: Option<Duration>) -> Self {
        self.approval_required = true;
        self.approval_timeout_secs = timeout.map(|t| t.as_secs());
        self
    }

    pub fn requires_approval(&self) -> bool {
        self.approval_required
    }

    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_secs.map(Duration::from_secs)
    }
}

/// Environments in promotion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    environments: Vec<Environment>,
}

impl Pipeline {
    /// Sort and validate the environments. Names and orders must be unique
    /// and every strategy must be valid.
    pub fn new(mut environments: Vec<Environment>) -> ReleaseResult<Self> {
        if environments.is_empty() {
            return Err(ReleaseError::Configuration(
                "at least one environment is required".into(),
            ));
        }
        environments.sort_by_key(|e| e.order);

        let mut names = HashSet::new();
        let mut orders = HashSet::new();
        for env in &environments {
            if env.name.trim().is_empty() || env.name.contains('/') {
                return Err(ReleaseError::Configuration(format!(
                    "invalid environment name {:?}",
                    env.name
                )));
            }
            if !names.insert(env.name.as_str()) {
                return Err(ReleaseError::Configuration(format!(
                    "duplicate environment {}",
                    env.name
                )));
            }
            if !orders.insert(env.order) {
                return Err(ReleaseError::Configuration(format!(
                    "environment {} reuses order {}",
                    env.name, env.order
                )));
            }
            if env.approval_timeout_secs == Some(0) {
                return Err(ReleaseError::Configuration(format!(
                    "environment {}: approval_timeout_secs must be at least 1",
                    env.name
                )));
            }
            env.strategy.validate().map_err(|e| {
                ReleaseError::Configuration(format!("environment {}: {e}", env.name))
            })?;
        }
        Ok(Self { environments })
    }

    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    pub fn get(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

/// A service released through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Image repository whose pushes trigger a release.
    pub repository: String,
    pub instances: InstanceBounds,
}

impl ServiceSpec {
    pub fn new(name: &str, repository: &str, instances: InstanceBounds) -> Self {
        Self {
            name: name.to_string(),
            repository: repository.to_string(),
            instances,
        }
    }

    pub fn validate(&self) -> ReleaseResult<()> {
        // '/' separates deployment IDs and ':' prefixes promotion IDs.
        if self.name.trim().is_empty() || self.name.contains(['/', ':']) {
            return Err(ReleaseError::Configuration(format!(
                "invalid service name {:?}",
                self.name
            )));
        }
        if self.repository.trim().is_empty() {
            return Err(ReleaseError::Configuration(format!(
                "service {} has no repository",
                self.name
            )));
        }
        if !self.instances.is_valid() {
            return Err(ReleaseError::Configuration(format!(
                "service {}: invalid instance bounds {}..={}",
                self.name, self.instances.min, self.instances.max
            )));
        }
        Ok(())
    }
}
