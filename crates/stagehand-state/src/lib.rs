//! stagehand-state — durable state for the release orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployments, the append-only promotion audit trail, and the
//! image index.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{environment}/{service}`, `{service}:{seq}`,
//! `{repository}@{digest}`) keep related records adjacent so prefix scans
//! return them in order.
//!
//! Deployment updates are read-modify-write closures executed inside a single
//! write transaction. redb serializes write transactions, so the strategy
//! engine and the autoscaler can each update their own field group without
//! overwriting the other's changes.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
