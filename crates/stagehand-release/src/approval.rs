//! Approval gates — the external signal a gated environment waits for.
//!
//! A run asks the gate for a ticket keyed by its promotion record ID and
//! waits on it. An operator (or automation) resolves the gate through
//! `approve` or `reject`. Waiting is cancellable and can be bounded by a
//! timeout; a timed-out ticket stays registered so the run can resume it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use stagehand_rollout::CancelSignal;
use stagehand_state::epoch_secs;

use crate::error::{ReleaseError, ReleaseResult};

/// How a gate was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved {
        approver: String,
    },
    Rejected {
        approver: String,
        reason: Option<String>,
    },
}

impl ApprovalDecision {
    /// Human-readable reason recorded on a rejected promotion.
    pub fn rejection_reason(&self) -> Option<String> {
        match self {
            Self::Approved { .. } => None,
            Self::Rejected {
                approver,
                reason: Some(reason),
            } => Some(format!("rejected by {approver}: {reason}")),
            Self::Rejected { approver, .. } => Some(format!("rejected by {approver}")),
        }
    }
}

/// A gate awaiting a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub promotion_id: String,
    pub service: String,
    pub environment: String,
    pub requested_at: u64,
}

/// What a wait on a ticket ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Decided(ApprovalDecision),
    Cancelled,
    TimedOut,
}

struct Gate {
    pending: PendingApproval,
    tx: watch::Sender<Option<ApprovalDecision>>,
}

/// Registry of open approval gates. Cheap to clone.
#[derive(Clone, Default)]
pub struct ApprovalGate {
    gates: Arc<Mutex<HashMap<String, Gate>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or rejoin) the gate for a promotion.
    pub fn request(&self, promotion_id: &str, service: &str, environment: &str) -> ApprovalTicket {
        let mut gates = self.lock();
        let gate = gates.entry(promotion_id.to_string()).or_insert_with(|| {
            info!(promotion = %promotion_id, %service, %environment, "approval requested");
            let (tx, _) = watch::channel(None);
            Gate {
                pending: PendingApproval {
                    promotion_id: promotion_id.to_string(),
                    service: service.to_string(),
                    environment: environment.to_string(),
                    requested_at: epoch_secs(),
                },
                tx,
            }
        });
        ApprovalTicket {
            promotion_id: promotion_id.to_string(),
            rx: gate.tx.subscribe(),
        }
    }

    pub fn approve(&self, promotion_id: &str, approver: &str) -> ReleaseResult<()> {
        self.resolve(
            promotion_id,
            ApprovalDecision::Approved {
                approver: approver.to_string(),
            },
        )?;
        info!(promotion = %promotion_id, %approver, "promotion approved");
        Ok(())
    }

    pub fn reject(
        &self,
        promotion_id: &str,
        approver: &str,
        reason: Option<&str>,
    ) -> ReleaseResult<()> {
        self.resolve(
            promotion_id,
            ApprovalDecision::Rejected {
                approver: approver.to_string(),
                reason: reason.map(str::to_string),
            },
        )?;
        info!(promotion = %promotion_id, %approver, ?reason, "promotion rejected");
        Ok(())
    }

    /// Open gates, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<_> = self.lock().values().map(|g| g.pending.clone()).collect();
        pending.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.promotion_id.cmp(&b.promotion_id))
        });
        pending
    }

    pub fn is_pending(&self, promotion_id: &str) -> bool {
        self.lock().contains_key(promotion_id)
    }

    /// Drop a gate without deciding it (its run was cancelled).
    pub fn withdraw(&self, promotion_id: &str) {
        self.lock().remove(promotion_id);
    }

    fn resolve(&self, promotion_id: &str, decision: ApprovalDecision) -> ReleaseResult<()> {
        let gate = self
            .lock()
            .remove(promotion_id)
            .ok_or_else(|| ReleaseError::UnknownApproval(promotion_id.to_string()))?;
        gate.tx.send_replace(Some(decision));
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Gate>> {
        self.gates.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A run's handle on one gate.
#[derive(Debug)]
pub struct ApprovalTicket {
    promotion_id: String,
    rx: watch::Receiver<Option<ApprovalDecision>>,
}

impl ApprovalTicket {
    pub fn promotion_id(&self) -> &str {
        &self.promotion_id
    }

    /// Wait for a decision, cancellation, or `timeout` (if any).
    pub async fn wait(&mut self, cancel: &mut CancelSignal, timeout: Option<Duration>) -> GateOutcome {
        let decided = Self::decided(&mut self.rx);
        let bounded = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, decided).await.ok(),
                None => Some(decided.await),
            }
        };
        tokio::select! {
            outcome = bounded => match outcome {
                Some(Some(decision)) => GateOutcome::Decided(decision),
                Some(None) => GateOutcome::Cancelled,
                None => GateOutcome::TimedOut,
            },
            _ = cancel.cancelled() => GateOutcome::Cancelled,
        }
    }

    /// `None` if the gate was withdrawn without a decision.
    async fn decided(
        rx: &mut watch::Receiver<Option<ApprovalDecision>>,
    ) -> Option<ApprovalDecision> {
        loop {
            if let Some(decision) = rx.borrow_and_update().clone() {
                return Some(decision);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approve_releases_waiter() {
        let gate = ApprovalGate::new();
        let mut ticket = gate.request("api:0000000003", "api", "production");
        assert_eq!(gate.pending().len(), 1);

        let waiter = tokio::spawn(async move {
            ticket.wait(&mut CancelSignal::never(), None).await
        });
        tokio::task::yield_now().await;
        gate.approve("api:0000000003", "alice").unwrap();

        assert_eq!(
            waiter.await.unwrap(),
            GateOutcome::Decided(ApprovalDecision::Approved {
                approver: "alice".into()
            })
        );
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn decision_before_wait_is_kept() {
        let gate = ApprovalGate::new();
        let mut ticket = gate.request("p1", "api", "production");
        gate.reject("p1", "bob", Some("freeze")).unwrap();

        let decision = match ticket.wait(&mut CancelSignal::never(), None).await {
            GateOutcome::Decided(decision) => decision,
            other => panic!("expected a decision, got {other:?}"),
        };
        assert_eq!(
            decision.rejection_reason().as_deref(),
            Some("rejected by bob: freeze")
        );
    }

    #[tokio::test]
    async fn unknown_promotion_rejected() {
        let gate = ApprovalGate::new();
        assert!(matches!(
            gate.approve("nope", "alice"),
            Err(ReleaseError::UnknownApproval(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_gate_open() {
        let gate = ApprovalGate::new();
        let mut ticket = gate.request("p1", "api", "production");

        let outcome = ticket
            .wait(&mut CancelSignal::never(), Some(Duration::from_secs(60)))
            .await;
        assert_eq!(outcome, GateOutcome::TimedOut);
        assert!(gate.is_pending("p1"));

        gate.approve("p1", "carol").unwrap();
        let outcome = ticket.wait(&mut CancelSignal::never(), None).await;
        assert!(matches!(outcome, GateOutcome::Decided(ApprovalDecision::Approved { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_wait() {
        let gate = ApprovalGate::new();
        let mut ticket = gate.request("p1", "api", "production");
        let (tx, rx) = watch::channel(false);
        let mut cancel = CancelSignal::new(rx);

        let waiter = tokio::spawn(async move { ticket.wait(&mut cancel, None).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        assert_eq!(waiter.await.unwrap(), GateOutcome::Cancelled);
    }

    #[test]
    fn rejection_reason_without_detail() {
        let decision = ApprovalDecision::Rejected {
            approver: "alice".into(),
            reason: None,
        };
        assert_eq!(decision.rejection_reason().as_deref(), Some("rejected by alice"));
    }
}
