//! Stagehand autoscaler — per-deployment capacity control loops.
//!
//! Each live deployment gets its own loop. Every tick it reads the
//! configured metric over a trailing window, computes
//! `round(current * observed / target)` clamped to the deployment's bounds,
//! and applies the change through the provisioner. Scale-down is held back
//! for a stabilization window after a scale-up, and ticks are deferred while
//! a strategy transition has traffic split or moving.
//!
//! # Components
//!
//! - **`policy`** — `AutoscalePolicy` and the sizing formula
//! - **`scaler`** — `Scaler` (decision state) and `ScaleLoop` (one deployment)
//! - **`supervisor`** — keeps exactly one loop per live deployment

pub mod error;
pub mod policy;
pub mod scaler;
pub mod supervisor;

pub use error::{ScaleError, ScaleResult};
pub use policy::{AutoscalePolicy, recommend};
pub use scaler::{ScaleDecision, ScaleLoop, Scaler};
pub use supervisor::AutoscaleSupervisor;
