//! Cancellation signal for long waits.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Receiving side of a cancel flag. Cancelled once the flag reads `true`.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancelled. Pends forever if the sender is gone.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration`. Returns `false` if cancelled first.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration).await
    }

    /// Sleep until `deadline`. Returns `false` if cancelled first.
    pub async fn sleep_until(&mut self, deadline: Instant) -> bool {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => true,
            _ = self.cancelled() => false,
        }
    }
}

impl From<watch::Receiver<bool>> for CancelSignal {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Self::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancel() {
        let mut signal = CancelSignal::never();
        assert!(signal.sleep(Duration::from_secs(60)).await);
        assert!(!signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_interrupted_by_cancel() {
        let (tx, rx) = watch::channel(false);
        let mut signal = CancelSignal::new(rx);
        let task = tokio::spawn(async move { signal.sleep(Duration::from_secs(600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        assert!(!task.await.unwrap());
    }

    #[tokio::test]
    async fn already_cancelled_returns_immediately() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let mut signal = CancelSignal::new(rx);
        assert!(signal.is_cancelled());
        assert!(!signal.sleep(Duration::from_secs(3600)).await);
    }
}
