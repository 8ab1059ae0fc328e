//! stagehand-registry — index of pushed images per repository.
//!
//! The index never talks to the real registry. It records what the build
//! pipeline reported through the trigger interface: which digests exist,
//! which tag points where, and which environments each digest has been
//! committed to.

pub mod index;

pub use index::{RegistryError, RegistryIndex, RegistryResult};
