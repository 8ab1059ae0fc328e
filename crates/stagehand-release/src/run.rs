//! One image's walk through the pipeline.

use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use stagehand_rollout::{CancelSignal, PromotionError};
use stagehand_state::{Deployment, Image, PromotionOutcome, PromotionRecord};

use crate::approval::{ApprovalTicket, GateOutcome};
use crate::environment::{Environment, ServiceSpec};
use crate::error::{ReleaseError, ReleaseResult};
use crate::orchestrator::{PromotionOptions, ReleaseOrchestrator};

/// A lazy, restartable sequence of promotion records, one per environment
/// in pipeline order. Holds the service lock until dropped.
pub struct PromotionRun {
    orchestrator: ReleaseOrchestrator,
    run_id: u64,
    service: ServiceSpec,
    image: Image,
    options: PromotionOptions,
    /// Index of the next environment to attempt.
    position: usize,
    halted: bool,
    /// A gate that timed out; the next call resumes waiting on it.
    paused: Option<(PromotionRecord, ApprovalTicket)>,
    cancel: CancelSignal,
    _guard: OwnedMutexGuard<()>,
}

impl PromotionRun {
    pub(crate) fn new(
        orchestrator: ReleaseOrchestrator,
        run_id: u64,
        service: ServiceSpec,
        image: Image,
        options: PromotionOptions,
        cancel: CancelSignal,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            orchestrator,
            run_id,
            service,
            image,
            options,
            position: 0,
            halted: false,
            paused: None,
            cancel,
            _guard: guard,
        }
    }

    pub fn service(&self) -> &str {
        &self.service.name
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Whether the run is waiting to resume a timed-out approval.
    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    /// Attempt the next environment and return its record. `None` once
    /// every environment was attempted or the run halted.
    ///
    /// An `ApprovalTimeout` error leaves the run paused on the same
    /// environment; calling `next` again resumes the wait.
    pub async fn next(&mut self) -> Option<ReleaseResult<PromotionRecord>> {
        if self.halted {
            return None;
        }
        let env = self
            .orchestrator
            .pipeline()
            .environments()
            .get(self.position)?
            .clone();

        let result = self.attempt(&env).await;
        match &result {
            Ok(record) => {
                self.position += 1;
                if self.cancel.is_cancelled()
                    || (record.outcome.halts_sequence() && !self.options.force)
                {
                    self.halted = true;
                }
            }
            Err(ReleaseError::ApprovalTimeout { .. }) => {}
            Err(_) => self.halted = true,
        }
        Some(result)
    }

    /// Drive the run to the end and return every record it produced.
    ///
    /// An approval timeout does not end the run: the gate stays open and
    /// the wait starts over until it is decided or the run is cancelled.
    pub async fn collect_all(mut self) -> ReleaseResult<Vec<PromotionRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            match record {
                Ok(record) => records.push(record),
                Err(ReleaseError::ApprovalTimeout {
                    promotion_id,
                    environment,
                }) => {
                    info!(
                        promotion = %promotion_id,
                        %environment,
                        "approval still outstanding; run stays paused"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn attempt(&mut self, env: &Environment) -> ReleaseResult<PromotionRecord> {
        let (record, ticket) = match self.paused.take() {
            Some((record, ticket)) => (record, Some(ticket)),
            None => (self.open_record()?, None),
        };

        if env.requires_approval() {
            let approvals = self.orchestrator.approvals();
            let mut ticket = ticket
                .unwrap_or_else(|| approvals.request(&record.id, &self.service.name, &env.name));
            match ticket.wait(&mut self.cancel, env.approval_timeout()).await {
                GateOutcome::Decided(decision) => {
                    if let Some(reason) = decision.rejection_reason() {
                        return self.finish(&record, PromotionOutcome::Failed, &reason);
                    }
                    info!(promotion = %record.id, environment = %env.name, "approval granted");
                }
                GateOutcome::Cancelled => {
                    approvals.withdraw(&record.id);
                    return self.finish(&record, PromotionOutcome::Failed, "cancelled");
                }
                GateOutcome::TimedOut => {
                    warn!(promotion = %record.id, environment = %env.name, "approval timed out");
                    let err = ReleaseError::ApprovalTimeout {
                        promotion_id: record.id.clone(),
                        environment: env.name.clone(),
                    };
                    self.paused = Some((record, ticket));
                    return Err(err);
                }
            }
        }

        if self.cancel.is_cancelled() {
            return self.finish(&record, PromotionOutcome::Failed, "cancelled");
        }

        let (outcome, reason) = match self.run_strategy(env).await {
            Ok(done) => done,
            Err(e) => {
                // Never leave the record pending behind a store failure.
                if let Err(close) = self.finish(&record, PromotionOutcome::Failed, &e.to_string()) {
                    warn!(promotion = %record.id, error = %close, "could not close promotion");
                }
                return Err(e);
            }
        };
        self.finish(&record, outcome, &reason)
    }

    fn open_record(&self) -> ReleaseResult<PromotionRecord> {
        let environments = self.orchestrator.pipeline().environments();
        let to_env = &environments[self.position].name;
        let from_env = self
            .position
            .checked_sub(1)
            .map(|prev| environments[prev].name.as_str());
        let record = PromotionRecord::pending(&self.service.name, self.image.clone(), from_env, to_env);
        Ok(self.orchestrator.store().insert_promotion(&record)?)
    }

    async fn run_strategy(&self, env: &Environment) -> ReleaseResult<(PromotionOutcome, String)> {
        let engine = self.orchestrator.engine();
        let id = Deployment::make_id(&env.name, &self.service.name);

        let (result, method) = if engine.store().get_deployment(&id)?.is_none() {
            let result = engine
                .bootstrap(&env.name, &self.service.name, self.image.clone(), self.service.instances)
                .await;
            (result, "bootstrap")
        } else {
            let result = engine
                .promote(&id, self.image.clone(), &env.strategy, self.cancel.clone())
                .await;
            (result, env.strategy.name())
        };

        Ok(match result {
            Ok(_) => {
                // The deployment is committed either way; the index is advisory.
                if let Err(e) = self
                    .orchestrator
                    .registry()
                    .mark_promoted(&self.image, &env.name)
                {
                    warn!(
                        image = %self.image,
                        environment = %env.name,
                        error = %e,
                        "could not record promotion in the registry index"
                    );
                }
                (
                    PromotionOutcome::Succeeded,
                    format!("committed {} to {} via {method}", self.image, env.name),
                )
            }
            Err(PromotionError::RolledBack { reason }) => (PromotionOutcome::RolledBack, reason),
            Err(PromotionError::Degraded { reason }) => {
                (PromotionOutcome::Failed, format!("degraded: {reason}"))
            }
            Err(PromotionError::Cancelled) => (PromotionOutcome::Failed, "cancelled".to_string()),
            Err(PromotionError::State(e)) => return Err(e.into()),
            Err(other) => (PromotionOutcome::Failed, other.to_string()),
        })
    }

    fn finish(
        &self,
        record: &PromotionRecord,
        outcome: PromotionOutcome,
        reason: &str,
    ) -> ReleaseResult<PromotionRecord> {
        let done = self
            .orchestrator
            .store()
            .complete_promotion(&record.id, outcome, reason)?;
        match outcome {
            PromotionOutcome::Succeeded => {
                info!(promotion = %done.id, environment = %done.to_env, %reason, "promotion succeeded")
            }
            _ => warn!(
                promotion = %done.id,
                environment = %done.to_env,
                %outcome,
                %reason,
                "promotion did not succeed"
            ),
        }
        Ok(done)
    }
}

impl Drop for PromotionRun {
    fn drop(&mut self) {
        // A paused record stays pending; startup recovery closes it if no
        // run ever resumes it.
        if let Some((record, _)) = &self.paused {
            self.orchestrator.approvals().withdraw(&record.id);
            warn!(promotion = %record.id, "run dropped while waiting for approval");
        }
        self.orchestrator.release_run(&self.service.name, self.run_id);
    }
}
