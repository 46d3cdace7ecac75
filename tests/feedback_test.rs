//! Outcome ingestion and retraining through the composed service

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fare_watch::alerts::LogAlertSink;
use fare_watch::desirability::DesirabilityBand;
use fare_watch::feedback::Adjustment;
use fare_watch::probe::{ProbeClient, ProbeError};
use fare_watch::reliability::{Authority, DealAnalysisRecord, Decision, OutcomeEvidence, OutcomeKind};
use fare_watch::store::{MemoryStore, Store};
use fare_watch::types::{DateWindow, PriceSample, ProbeResult, Route, RouteCode, Tier};
use fare_watch::{Collaborators, Config, FeedbackError, Service};
use std::sync::Arc;

struct NoProbe;

#[async_trait]
impl ProbeClient for NoProbe {
    async fn probe(&self, _route: &RouteCode, _window: &DateWindow) -> Result<Vec<PriceSample>, ProbeError> {
        Ok(Vec::new())
    }
}

async fn build(store: Arc<MemoryStore>) -> anyhow::Result<Service> {
    Service::with_collaborators(
        Config::default(),
        Collaborators {
            store,
            probe: Arc::new(NoProbe),
            oracle: None,
            alerts: Arc::new(LogAlertSink),
        },
    )
    .await
}

fn record(id: &str, decision: Decision, band: DesirabilityBand) -> DealAnalysisRecord {
    let now = Utc::now();
    DealAnalysisRecord {
        id: id.to_string(),
        probe: ProbeResult {
            route: RouteCode::new("JFK", "LHR"),
            price: 180.0,
            reference_price: Some(400.0),
            discount: 0.55,
            carrier: "XX".into(),
            fare_class: "economy".into(),
            seats_available: Some(4),
            observed_at: now,
        },
        band,
        factors: vec![],
        score: 72.0,
        oracle: None,
        decision,
        thresholds_version: 0,
        analyzed_at: now - Duration::hours(1),
        outcome: None,
    }
}

fn evidence(authority: Authority) -> OutcomeEvidence {
    OutcomeEvidence {
        authority,
        booked: false,
        note: None,
    }
}

#[tokio::test]
async fn test_outcome_authority_ordering() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.save_analysis(&record("r1", Decision::Accept, DesirabilityBand::Prime)).await?;
    let service = build(store.clone()).await?;

    let written = service
        .feedback
        .ingest_outcome("r1", OutcomeKind::GenuineDeal, evidence(Authority::UserReport))
        .await?;
    assert_eq!(written.outcome.as_ref().and_then(|o| o.verdict_correct), Some(true));

    // Same authority cannot overwrite
    let err = service
        .feedback
        .ingest_outcome("r1", OutcomeKind::PricingError, evidence(Authority::UserReport))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FeedbackError::Conflict {
            existing: OutcomeKind::GenuineDeal,
            ..
        }
    ));

    // A confirmed booking wins
    let written = service
        .feedback
        .ingest_outcome("r1", OutcomeKind::PricingError, evidence(Authority::BookingConfirmed))
        .await?;
    let outcome = written.outcome.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::PricingError);
    assert_eq!(outcome.verdict_correct, Some(false));

    let missing = service
        .feedback
        .ingest_outcome("nope", OutcomeKind::Expired, evidence(Authority::UserReport))
        .await
        .unwrap_err();
    assert!(matches!(missing, FeedbackError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn test_false_accepts_tighten_and_persist() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..10 {
        store
            .save_analysis(&record(&format!("r{}", i), Decision::Accept, DesirabilityBand::Standard))
            .await?;
    }
    let service = build(store.clone()).await?;
    for i in 0..10 {
        let kind = if i < 6 {
            OutcomeKind::PricingError
        } else {
            OutcomeKind::GenuineDeal
        };
        service
            .feedback
            .ingest_outcome(&format!("r{}", i), kind, evidence(Authority::AutomatedRecheck))
            .await?;
    }

    let report = service.feedback.retrain(Utc::now()).await?;
    assert_eq!(report.stats.decided, 10);
    assert_eq!(report.stats.false_accepts, 6);
    assert_eq!(report.version, 1);
    match report.adjustment {
        Adjustment::TightenedDiscount { from, to } => {
            assert!((from - 0.60).abs() < 1e-9);
            assert!((to - 0.57).abs() < 1e-9);
        }
        other => panic!("expected a tightened discount, got {:?}", other),
    }

    // A restarted service picks up the tuned set
    let restarted = build(store).await?;
    let restored = restarted.thresholds.load();
    assert_eq!(restored.version, 1);
    assert!((restored.suspicious_discount - 0.57).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn test_too_few_outcomes_leave_thresholds_alone() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..3 {
        store
            .save_analysis(&record(&format!("r{}", i), Decision::Accept, DesirabilityBand::Standard))
            .await?;
    }
    let service = build(store).await?;
    for i in 0..3 {
        service
            .feedback
            .ingest_outcome(&format!("r{}", i), OutcomeKind::PricingError, evidence(Authority::UserReport))
            .await?;
    }

    let report = service.feedback.retrain(Utc::now()).await?;
    assert!(matches!(report.adjustment, Adjustment::Unchanged { .. }));
    assert_eq!(service.thresholds.load().version, 0);
    Ok(())
}

#[tokio::test]
async fn test_route_tuning_promotes_productive_routes() -> anyhow::Result<()> {
    let mut productive = Route::new(RouteCode::new("JFK", "LHR"), Tier::Low);
    productive.probe_count = 40;
    productive.accepted_deals = 8;
    let mut quiet = Route::new(RouteCode::new("BOS", "SFO"), Tier::Medium);
    quiet.probe_count = 400;

    let store = Arc::new(MemoryStore::with_routes(vec![productive, quiet]).await);
    let service = build(store.clone()).await?;

    let changes = service.feedback.tune_routes(&service.registry).await?;
    assert_eq!(changes.len(), 2);

    let promoted = store.route(&RouteCode::new("JFK", "LHR")).await.unwrap();
    assert_eq!(promoted.tier, Tier::Medium);
    let demoted = store.route(&RouteCode::new("BOS", "SFO")).await.unwrap();
    assert_eq!(demoted.tier, Tier::Low);
    assert!(demoted.active);
    Ok(())
}

#[tokio::test]
async fn test_retrain_builds_on_set_persisted_by_another_process() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..10 {
        store
            .save_analysis(&record(&format!("r{}", i), Decision::Accept, DesirabilityBand::Standard))
            .await?;
    }
    let daemon = build(store.clone()).await?;
    let offline = build(store.clone()).await?;
    for i in 0..10 {
        let kind = if i < 6 {
            OutcomeKind::PricingError
        } else {
            OutcomeKind::GenuineDeal
        };
        offline
            .feedback
            .ingest_outcome(&format!("r{}", i), kind, evidence(Authority::AutomatedRecheck))
            .await?;
    }

    let first = offline.feedback.retrain(Utc::now()).await?;
    assert_eq!(first.version, 1);
    assert_eq!(daemon.thresholds.load().version, 0);

    // The running service picks up v1 and nudges from there instead of overwriting it
    let second = daemon.feedback.retrain(Utc::now()).await?;
    assert_eq!(second.version, 2);
    let live = daemon.thresholds.load();
    assert!((live.suspicious_discount - 0.60 * 0.95 * 0.95).abs() < 1e-9);

    let persisted = store.load_thresholds().await?.expect("thresholds persisted");
    assert_eq!(persisted.version, 2);
    Ok(())
}
