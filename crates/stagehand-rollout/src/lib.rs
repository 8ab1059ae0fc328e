//! Stagehand deployment strategies — blue/green and canary transitions.
//!
//! This crate drives one deployment from its active image to a candidate
//! image. Blue/green provisions a full parallel set, switches all traffic at
//! once and verifies it with health probes. Canary shifts traffic in steps
//! and compares candidate metrics against the baseline after each step.
//! Either way, the previous set keeps running until the transition commits,
//! so a rollback is always a single route change.
//!
//! # Components
//!
//! - **`strategy`** — Strategy configuration and validation (BlueGreen, Canary)
//! - **`engine`** — `StrategyEngine`, the transition state machine
//! - **`analysis`** — Canary health judgement over cohort metrics
//! - **`provider`** — Collaborator traits (provisioner, metrics, health probe)
//! - **`memory`** — In-memory collaborators for tests and local runs
//! - **`retry`** — Exponential backoff for provisioner calls
//! - **`cancel`** — Cancellation signal shared with long waits
//! - **`locks`** — Per-deployment strategy and scaling locks

pub mod analysis;
pub mod cancel;
pub mod engine;
pub mod error;
pub mod locks;
pub mod memory;
pub mod provider;
pub mod retry;
pub mod strategy;

pub use analysis::CohortHealth;
pub use cancel::CancelSignal;
pub use engine::StrategyEngine;
pub use error::{Interrupted, PromotionError, PromotionResult, ProvisionError, VerificationFailure};
pub use locks::DeploymentLocks;
pub use memory::{InMemoryProvisioner, ScriptedMetrics, ScriptedProbe};
pub use provider::{
    Cohort, HealthProbe, InstanceSpec, MetricQuery, MetricsError, MetricsSource, ProbeResult,
    Provisioner, RequestToken, TrafficRoute,
};
pub use retry::RetryPolicy;
pub use strategy::{BlueGreenConfig, CanaryConfig, RolloutStrategy};
