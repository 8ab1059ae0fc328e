//! stagehandd — configuration and process wiring for the Stagehand daemon.

pub mod config;
pub mod daemon;

pub use config::{ConfigError, StagehandConfig};
pub use daemon::Daemon;
