//! Per-service promotion locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One FIFO lock per service. A run holds its service's lock for its whole
/// lifetime, so a second run for the same service queues behind it.
#[derive(Clone, Default)]
pub struct ServiceLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ServiceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, service: &str) -> OwnedMutexGuard<()> {
        self.lock_for(service).lock_owned().await
    }

    /// Whether a run currently holds the service.
    pub fn is_held(&self, service: &str) -> bool {
        self.lock_for(service).try_lock().is_err()
    }

    fn lock_for(&self, service: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(service.to_string()).or_default().clone()
    }
}
