//! Full pipeline runs against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use stagehand_registry::RegistryIndex;
use stagehand_release::{
    ApprovalGate, Environment, Pipeline, PromotionOptions, ReleaseError, ReleaseOrchestrator,
    ServiceSpec,
};
use stagehand_rollout::provider::{METRIC_ERROR_RATE, METRIC_P99_LATENCY_MS};
use stagehand_rollout::{
    CanaryConfig, Cohort, InMemoryProvisioner, ProbeResult, RolloutStrategy, ScriptedMetrics,
    ScriptedProbe, StrategyEngine,
};
use stagehand_state::{
    Deployment, Image, InstanceBounds, PromotionOutcome, PromotionRecord, StateStore,
    StrategyState,
};

const REPOSITORY: &str = "registry.local/svc";

fn image(c: char, tag: &str) -> Image {
    Image::new(REPOSITORY, tag, &format!("sha256:{}", c.to_string().repeat(64)))
}

fn pipeline(approval_timeout: Option<Duration>) -> Pipeline {
    Pipeline::new(vec![
        Environment::new("dev", 0, RolloutStrategy::default()),
        Environment::new("staging", 1, RolloutStrategy::Canary(CanaryConfig::default())),
        Environment::new("production", 2, RolloutStrategy::default()).with_approval(approval_timeout),
    ])
    .unwrap()
}

struct Harness {
    orch: ReleaseOrchestrator,
    store: StateStore,
    provisioner: Arc<InMemoryProvisioner>,
}

impl Harness {
    fn new(probe: ScriptedProbe, approval_timeout: Option<Duration>) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let metrics = Arc::new(ScriptedMetrics::new());
        for cohort in [Cohort::Baseline, Cohort::Candidate] {
            metrics.set("staging/svc", Some(cohort), METRIC_ERROR_RATE, vec![0.01, 0.012]);
            metrics.set("staging/svc", Some(cohort), METRIC_P99_LATENCY_MS, vec![140.0]);
        }
        let engine = StrategyEngine::new(
            store.clone(),
            provisioner.clone(),
            Arc::new(probe),
            metrics,
        );
        let orch = ReleaseOrchestrator::new(
            pipeline(approval_timeout),
            vec![ServiceSpec::new("svc", REPOSITORY, InstanceBounds::new(2, 6))],
            engine,
            RegistryIndex::new(store.clone()),
        )
        .unwrap();
        Self {
            orch,
            store,
            provisioner,
        }
    }

    /// Every environment already runs v1.
    async fn seed(&self) {
        for env in ["dev", "staging", "production"] {
            self.orch
                .engine()
                .bootstrap(env, "svc", image('a', "v1"), InstanceBounds::new(2, 6))
                .await
                .unwrap();
        }
    }

    fn deployment(&self, env: &str) -> Deployment {
        self.orch.get_deployment(env, "svc").unwrap().unwrap()
    }

    fn records(&self) -> Vec<PromotionRecord> {
        self.orch.list_promotions("svc").unwrap()
    }
}

/// Approve every gate that opens, polling once a second.
fn auto_approve(gate: ApprovalGate) {
    tokio::spawn(async move {
        loop {
            for pending in gate.pending() {
                let _ = gate.approve(&pending.promotion_id, "release-bot");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

#[tokio::test(start_paused = true)]
async fn dev_staging_then_production_rejected() {
    let h = Harness::new(ScriptedProbe::healthy(), None);
    h.seed().await;
    let candidate = image('b', "abc123");

    let mut run = h
        .orch
        .promote(candidate.clone(), PromotionOptions::default())
        .await
        .unwrap();

    // dev: blue/green, commits after one minute of clean probes.
    let started = Instant::now();
    let dev = run.next().await.unwrap().unwrap();
    assert!(started.elapsed() <= Duration::from_secs(60));
    assert_eq!(dev.to_env, "dev");
    assert_eq!(dev.from_env, None);
    assert_eq!(dev.outcome, PromotionOutcome::Succeeded);
    assert_eq!(h.deployment("dev").active_image.digest, candidate.digest);

    // staging: canary through every step.
    let staging = run.next().await.unwrap().unwrap();
    assert_eq!(staging.from_env.as_deref(), Some("dev"));
    assert_eq!(staging.outcome, PromotionOutcome::Succeeded);
    let weights = h.provisioner.weight_history("staging/svc");
    assert_eq!(&weights[..4], &[5, 25, 50, 100]);

    // production: gated, and the operator says no.
    let gate = h.orch.approvals().clone();
    let rejecter = tokio::spawn(async move {
        loop {
            if let Some(pending) = gate.pending().into_iter().next() {
                gate.reject(&pending.promotion_id, "alice", None).unwrap();
                return pending;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
    let production = run.next().await.unwrap().unwrap();
    let pending = rejecter.await.unwrap();
    assert_eq!(pending.promotion_id, production.id);
    assert_eq!(pending.environment, "production");
    assert_eq!(production.outcome, PromotionOutcome::Failed);
    assert_eq!(production.reason, "rejected by alice");
    assert!(run.next().await.is_none());

    let prod = h.deployment("production");
    assert_eq!(prod.active_image.digest, image('a', "v1").digest);
    assert_eq!(prod.strategy_state, StrategyState::Committed);
    assert!(prod.candidate_image.is_none());

    let records = h.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.outcome.is_terminal()));

    let registry = h.orch.registry();
    let in_staging = registry.current_in(REPOSITORY, "staging").unwrap().unwrap();
    assert_eq!(in_staging.image.digest, candidate.digest);
    assert!(registry.current_in(REPOSITORY, "production").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn first_release_bootstraps_each_environment() {
    let h = Harness::new(ScriptedProbe::healthy(), None);
    auto_approve(h.orch.approvals().clone());

    let records = h
        .orch
        .promote(image('b', "v1"), PromotionOptions::default())
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.outcome, PromotionOutcome::Succeeded, "{}", record.reason);
        assert!(record.reason.contains("via bootstrap"), "{}", record.reason);
    }
    assert_eq!(h.deployment("production").instance_count, 2);
}

#[tokio::test(start_paused = true)]
async fn rollback_halts_unless_forced() {
    let h = Harness::new(
        ScriptedProbe::new(vec![ProbeResult::Unhealthy], ProbeResult::Healthy),
        None,
    );
    h.seed().await;

    let records = h
        .orch
        .promote(image('b', "v2"), PromotionOptions::default())
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, PromotionOutcome::RolledBack);
    assert_eq!(h.deployment("staging").active_image.digest, image('a', "v1").digest);

    // Same failure pattern, but the caller forces the run on.
    let h = Harness::new(
        ScriptedProbe::new(vec![ProbeResult::Unhealthy], ProbeResult::Healthy),
        None,
    );
    h.seed().await;
    auto_approve(h.orch.approvals().clone());
    let records = h
        .orch
        .promote(image('b', "v2"), PromotionOptions { force: true })
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let outcomes: Vec<_> = records.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        [
            PromotionOutcome::RolledBack,
            PromotionOutcome::Succeeded,
            PromotionOutcome::Succeeded
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn same_service_runs_are_queued() {
    let h = Harness::new(ScriptedProbe::healthy(), None);
    h.seed().await;
    auto_approve(h.orch.approvals().clone());

    let mut first = h
        .orch
        .promote(image('b', "v2"), PromotionOptions::default())
        .await
        .unwrap();

    let second = {
        let orch = h.orch.clone();
        tokio::spawn(async move {
            orch.promote(image('c', "v3"), PromotionOptions::default())
                .await
                .unwrap()
                .collect_all()
                .await
                .unwrap()
        })
    };

    first.next().await.unwrap().unwrap();
    assert!(!second.is_finished());
    // Only the first run's dev record exists; the second has not started.
    assert_eq!(h.records().len(), 1);

    while let Some(record) = first.next().await {
        record.unwrap();
    }
    drop(first);

    let second_records = second.await.unwrap();
    assert_eq!(second_records.len(), 3);

    let records = h.records();
    assert_eq!(records.len(), 6);
    let digests: Vec<char> = records
        .iter()
        .map(|r| r.image.digest.chars().last().unwrap())
        .collect();
    assert_eq!(digests, ['b', 'b', 'b', 'c', 'c', 'c']);
    assert_eq!(h.deployment("production").active_image.digest, image('c', "v3").digest);
}

#[tokio::test(start_paused = true)]
async fn approval_timeout_pauses_and_resumes() {
    let h = Harness::new(ScriptedProbe::healthy(), Some(Duration::from_secs(600)));
    h.seed().await;

    let mut run = h
        .orch
        .promote(image('b', "v2"), PromotionOptions::default())
        .await
        .unwrap();
    run.next().await.unwrap().unwrap();
    run.next().await.unwrap().unwrap();

    let err = run.next().await.unwrap().unwrap_err();
    let ReleaseError::ApprovalTimeout { promotion_id, environment } = err else {
        panic!("expected approval timeout");
    };
    assert_eq!(environment, "production");
    assert!(run.is_paused());
    let record = h.orch.get_promotion(&promotion_id).unwrap().unwrap();
    assert_eq!(record.outcome, PromotionOutcome::Pending);

    h.orch.approvals().approve(&promotion_id, "carol").unwrap();
    let production = run.next().await.unwrap().unwrap();
    assert_eq!(production.id, promotion_id);
    assert_eq!(production.outcome, PromotionOutcome::Succeeded);
    assert!(run.next().await.is_none());
    assert_eq!(h.records().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn dispatched_run_outlives_approval_timeout() {
    let h = Harness::new(ScriptedProbe::healthy(), Some(Duration::from_secs(60)));
    h.seed().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = {
        let orch = h.orch.clone();
        tokio::spawn(async move { orch.run_dispatcher(shutdown_rx).await })
    };

    let digest = format!("sha256:{}", "d".repeat(64));
    h.orch.on_image_pushed(REPOSITORY, "v4", &digest).await.unwrap();

    let mut gated = None;
    for _ in 0..3600 {
        if let Some(pending) = h.orch.approvals().pending().into_iter().next() {
            gated = Some(pending);
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let gated = gated.expect("production gate opened");
    assert_eq!(gated.environment, "production");

    // Several timeouts pass without a decision.
    tokio::time::sleep(Duration::from_secs(300)).await;
    let record = h.orch.get_promotion(&gated.promotion_id).unwrap().unwrap();
    assert_eq!(record.outcome, PromotionOutcome::Pending);
    assert!(h.orch.approvals().is_pending(&gated.promotion_id));
    assert_eq!(h.deployment("production").active_image.digest, image('a', "v1").digest);

    h.orch.approvals().approve(&gated.promotion_id, "carol").unwrap();
    let mut record = record;
    for _ in 0..600 {
        record = h.orch.get_promotion(&gated.promotion_id).unwrap().unwrap();
        if record.outcome.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(record.outcome, PromotionOutcome::Succeeded);
    assert_eq!(h.deployment("production").active_image.digest, digest);

    shutdown_tx.send(true).unwrap();
    dispatcher.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropping_paused_run_keeps_record_pending() {
    let h = Harness::new(ScriptedProbe::healthy(), Some(Duration::from_secs(60)));
    h.seed().await;

    let mut run = h
        .orch
        .promote(image('b', "v2"), PromotionOptions::default())
        .await
        .unwrap();
    run.next().await.unwrap().unwrap();
    run.next().await.unwrap().unwrap();
    let Err(ReleaseError::ApprovalTimeout { promotion_id, .. }) = run.next().await.unwrap() else {
        panic!("expected approval timeout");
    };
    drop(run);

    let record = h.orch.get_promotion(&promotion_id).unwrap().unwrap();
    assert_eq!(record.outcome, PromotionOutcome::Pending);
    assert!(h.orch.approvals().pending().is_empty());

    let report = h.orch.recover().await.unwrap();
    assert_eq!(report.promotions_closed, vec![promotion_id]);
}

#[tokio::test(start_paused = true)]
async fn commit_is_recorded_when_index_lost_the_image() {
    let h = Harness::new(ScriptedProbe::healthy(), None);
    h.seed().await;
    let candidate = image('b', "v2");

    let mut run = h
        .orch
        .promote(candidate.clone(), PromotionOptions::default())
        .await
        .unwrap();
    assert!(h.orch.registry().forget(REPOSITORY, &candidate.digest).unwrap());

    let dev = run.next().await.unwrap().unwrap();
    assert_eq!(dev.outcome, PromotionOutcome::Succeeded);
    assert_eq!(h.deployment("dev").active_image.digest, candidate.digest);
    assert!(h.orch.registry().current_in(REPOSITORY, "dev").unwrap().is_none());
    assert!(h.records().iter().all(|r| r.outcome.is_terminal()));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_approval_leaves_earlier_environments() {
    let h = Harness::new(ScriptedProbe::healthy(), None);
    h.seed().await;
    let candidate = image('b', "v2");

    let mut run = h
        .orch
        .promote(candidate.clone(), PromotionOptions::default())
        .await
        .unwrap();
    run.next().await.unwrap().unwrap();
    run.next().await.unwrap().unwrap();

    let orch = h.orch.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(orch.cancel("svc"));
    });
    let production = run.next().await.unwrap().unwrap();
    assert_eq!(production.outcome, PromotionOutcome::Failed);
    assert_eq!(production.reason, "cancelled");
    assert!(run.next().await.is_none());
    assert!(h.orch.approvals().pending().is_empty());

    assert_eq!(h.deployment("dev").active_image.digest, candidate.digest);
    assert_eq!(h.deployment("staging").active_image.digest, candidate.digest);
    assert_eq!(h.deployment("production").active_image.digest, image('a', "v1").digest);

    drop(run);
    assert!(!h.orch.cancel("svc"));
}

#[tokio::test(start_paused = true)]
async fn recover_rolls_back_and_closes_records() {
    let h = Harness::new(ScriptedProbe::healthy(), None);
    h.seed().await;

    // Simulate a crash mid-verification in dev.
    let candidates = h.provisioner.seed_instances(2);
    h.store
        .update_deployment("dev/svc", |d| {
            d.candidate_image = Some(image('b', "v2"));
            d.candidate_instances = candidates.clone();
            d.candidate_weight = 100;
            d.generation += 1;
            d.strategy_state = StrategyState::Verifying { probes_passed: 2 };
            Ok(())
        })
        .unwrap();
    let orphan = h
        .store
        .insert_promotion(&PromotionRecord::pending("svc", image('b', "v2"), None, "dev"))
        .unwrap();

    let report = h.orch.recover().await.unwrap();
    assert_eq!(report.deployments_rolled_back, vec!["dev/svc".to_string()]);
    assert!(report.deployments_degraded.is_empty());
    assert_eq!(report.promotions_closed, vec![orphan.id.clone()]);

    let dev = h.deployment("dev");
    assert!(matches!(dev.strategy_state, StrategyState::RolledBack { .. }));
    assert_eq!(dev.active_image.digest, image('a', "v1").digest);
    for id in &candidates {
        assert!(!h.provisioner.is_alive(id));
    }
    let route = h.provisioner.route("dev/svc").unwrap();
    assert_eq!(route.stable, dev.active_instances);
    assert_eq!(route.candidate_weight, 0);

    let closed = h.orch.get_promotion(&orphan.id).unwrap().unwrap();
    assert_eq!(closed.outcome, PromotionOutcome::Failed);
    assert_eq!(closed.reason, "interrupted by restart");
}

#[tokio::test(start_paused = true)]
async fn pushed_image_is_dispatched() {
    let h = Harness::new(ScriptedProbe::healthy(), None);
    h.seed().await;
    auto_approve(h.orch.approvals().clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = {
        let orch = h.orch.clone();
        tokio::spawn(async move { orch.run_dispatcher(shutdown_rx).await })
    };

    let digest = format!("sha256:{}", "d".repeat(64));
    let request = h.orch.on_image_pushed(REPOSITORY, "v4", &digest).await.unwrap();
    assert_eq!(request.service, "svc");
    assert_eq!(h.orch.registry().resolve(REPOSITORY, "v4").unwrap().unwrap().digest, digest);

    let mut finished = Vec::new();
    for _ in 0..3600 {
        finished = h.records();
        if finished.len() == 3 && finished.iter().all(|r| r.outcome.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(finished.len(), 3);
    assert!(finished.iter().all(|r| r.outcome == PromotionOutcome::Succeeded));
    assert_eq!(h.deployment("production").active_image.digest, digest);

    shutdown_tx.send(true).unwrap();
    dispatcher.await.unwrap();
}

#[tokio::test]
async fn unknown_repository_is_rejected() {
    let h = Harness::new(ScriptedProbe::healthy(), None);
    let digest = format!("sha256:{}", "e".repeat(64));
    let err = h
        .orch
        .on_image_pushed("registry.local/other", "v1", &digest)
        .await
        .unwrap_err();
    assert!(matches!(err, ReleaseError::UnknownService(_)), "{err}");

    let err = h
        .orch
        .on_image_pushed(REPOSITORY, "v1", "sha256:short")
        .await
        .unwrap_err();
    assert!(matches!(err, ReleaseError::Registry(_)), "{err}");
}
