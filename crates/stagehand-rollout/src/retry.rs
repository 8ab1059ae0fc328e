//! Exponential backoff for provisioner calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::error::{Interrupted, ProvisionError};

/// Retry policy applied to every provisioner call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay_secs: u64,
    /// Upper bound on a single delay.
    pub max_delay_secs: u64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 2,
            max_delay_secs: 30,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let secs = self.base_delay_secs.saturating_mul(factor);
        Duration::from_secs(secs.min(self.max_delay_secs))
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// With a `cancel` signal, backoff waits end early and return
    /// [`Interrupted::Cancelled`]. Calls made on the rollback path pass
    /// `None` so they always run to completion.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut cancel: Option<&mut CancelSignal>,
        mut call: F,
    ) -> Result<T, Interrupted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProvisionError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(%operation, attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.retryable || attempt >= max_attempts => {
                    warn!(%operation, attempt, error = %e, "giving up on call");
                    return Err(e.into());
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        %operation,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "call failed, backing off"
                    );
                    match cancel.as_deref_mut() {
                        Some(signal) => {
                            if !signal.sleep(delay).await {
                                return Err(Interrupted::Cancelled);
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                    attempt += 1;
                }
            }
        }
    }
}
