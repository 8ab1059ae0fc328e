//! Daemon configuration, read from a TOML file.
//!
//! ```toml
//! [server]
//! port = 8443
//!
//! [[environments]]
//! name = "dev"
//! order = 0
//!
//! [[services]]
//! name = "api"
//! repository = "registry.local/api"
//! instances = { min = 2, max = 10 }
//! ```

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use stagehand_autoscale::AutoscalePolicy;
use stagehand_release::{Environment, Pipeline, ServiceSpec};
use stagehand_rollout::RetryPolicy;
use stagehand_state::InstanceBounds;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StagehandConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    /// Backoff for every provisioner call.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Autoscale policy for services without their own.
    #[serde(default)]
    pub autoscale: AutoscalePolicy,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    pub environments: Vec<Environment>,
    pub services: Vec<ServiceConfig>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    8443
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Persistent state location.
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/stagehand")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StateConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("stagehand.redb")
    }
}

/// How often the autoscale supervisor reconciles its loops.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

const fn default_reconcile_interval_secs() -> u64 {
    15
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// A released service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub repository: String,
    pub instances: InstanceBounds,
    /// Overrides the top-level `[autoscale]` policy.
    #[serde(default)]
    pub autoscale: Option<AutoscalePolicy>,
}

impl ServiceConfig {
    pub fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(&self.name, &self.repository, self.instances)
    }
}

impl StagehandConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Report every configuration problem up front, before anything runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline()?;

        if self.services.is_empty() {
            return Err(ConfigError::Invalid("at least one service is required".into()));
        }
        let mut names = HashSet::new();
        let mut repositories = HashSet::new();
        for service in &self.services {
            service
                .spec()
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service {}",
                    service.name
                )));
            }
            if !repositories.insert(service.repository.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "repository {} is used by more than one service",
                    service.repository
                )));
            }
            if let Some(policy) = &service.autoscale {
                policy.validate().map_err(|e| {
                    ConfigError::Invalid(format!("service {}: {e}", service.name))
                })?;
            }
        }

        self.autoscale
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("autoscale: {e}")))?;
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            return Err(ConfigError::Invalid(
                "retry.base_delay_secs exceeds retry.max_delay_secs".into(),
            ));
        }
        if self.supervisor.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.reconcile_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn pipeline(&self) -> Result<Pipeline, ConfigError> {
        Pipeline::new(self.environments.clone()).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn service_specs(&self) -> Vec<ServiceSpec> {
        self.services.iter().map(ServiceConfig::spec).collect()
    }
}

#[cfg(test)]
mod tests {
    use stagehand_rollout::RolloutStrategy;

    use super::*;

    const SAMPLE: &str = include_str!("../stagehand.toml");

    #[test]
    fn sample_config_is_valid() {
        let config = StagehandConfig::parse(SAMPLE).unwrap();
        let pipeline = config.pipeline().unwrap();
        let names: Vec<_> = pipeline.environments().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["dev", "staging", "production"]);
        assert!(pipeline.get("production").unwrap().requires_approval());
        assert!(matches!(
            pipeline.get("staging").unwrap().strategy,
            RolloutStrategy::Canary(_)
        ));
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.service_specs().len(), 2);
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = StagehandConfig::parse(
            r#"
            [[environments]]
            name = "dev"
            order = 0

            [[services]]
            name = "api"
            repository = "registry.local/api"
            instances = { min = 1, max = 3 }
            "#,
        )
        .unwrap();
        assert_eq!(config.server.addr().port(), 8443);
        assert_eq!(config.state.db_path(), PathBuf::from("/var/lib/stagehand/stagehand.redb"));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.autoscale, AutoscalePolicy::default());
        assert_eq!(config.supervisor.reconcile_interval(), Duration::from_secs(15));
        assert!(config.services[0].autoscale.is_none());
    }

    #[test]
    fn duplicate_repository_rejected() {
        let err = StagehandConfig::parse(
            r#"
            [[environments]]
            name = "dev"
            order = 0

            [[services]]
            name = "api"
            repository = "registry.local/api"
            instances = { min = 1, max = 3 }

            [[services]]
            name = "api-v2"
            repository = "registry.local/api"
            instances = { min = 1, max = 3 }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than one service"), "{err}");
    }

    #[test]
    fn bad_canary_steps_rejected() {
        let err = StagehandConfig::parse(
            r#"
            [[environments]]
            name = "staging"
            order = 0
            [environments.strategy]
            kind = "canary"
            steps = [50, 25, 100]

            [[services]]
            name = "api"
            repository = "registry.local/api"
            instances = { min = 1, max = 3 }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn colon_in_service_name_rejected() {
        let err = StagehandConfig::parse(
            r#"
            [[environments]]
            name = "dev"
            order = 0

            [[services]]
            name = "api:internal"
            repository = "registry.local/api"
            instances = { min = 1, max = 3 }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid service name"), "{err}");
    }

    #[test]
    fn missing_file_reported() {
        let err = StagehandConfig::from_file("/nonexistent/stagehand.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagehand.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = StagehandConfig::from_file(&path).unwrap();
        assert_eq!(config.services[0].name, "api");
    }
}
