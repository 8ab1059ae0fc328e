//! Stagehand release orchestrator.
//!
//! Takes a pushed image through the pipeline's environments in order. For
//! each environment it opens an audit record, waits on the approval gate if
//! the environment has one, and hands the transition to the strategy
//! engine. A failed or rolled-back environment halts the run unless the
//! caller forces it on.
//!
//! # Components
//!
//! - **`environment`** — Environments, the ordered pipeline, service specs
//! - **`approval`** — Approval gates and their tickets
//! - **`orchestrator`** — `ReleaseOrchestrator`, trigger queue, recovery
//! - **`run`** — `PromotionRun`, the lazy per-environment sequence
//! - **`locks`** — Per-service promotion locks

pub mod approval;
pub mod environment;
pub mod error;
pub mod locks;
pub mod orchestrator;
pub mod run;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalTicket, GateOutcome, PendingApproval};
pub use environment::{Environment, Pipeline, ServiceSpec};
pub use error::{ReleaseError, ReleaseResult};
pub use locks::ServiceLocks;
pub use orchestrator::{PromotionOptions, PromotionRequest, RecoveryReport, ReleaseOrchestrator};
pub use run::PromotionRun;
