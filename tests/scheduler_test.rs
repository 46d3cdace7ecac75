//! End-to-end scheduling ticks through the composed service

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fare_watch::alerts::AlertSink;
use fare_watch::probe::{ProbeClient, ProbeError};
use fare_watch::reliability::DealAnalysisRecord;
use fare_watch::store::{MemoryStore, Store};
use fare_watch::types::{DateWindow, PriceSample, Route, RouteCode, Tier};
use fare_watch::{Collaborators, Config, Service};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Returns one clean fare per call, optionally after a delay
struct FakeProbe {
    calls: AtomicUsize,
    probed: Mutex<Vec<RouteCode>>,
    delay: Option<Duration>,
    observed_at: DateTime<Utc>,
}

impl FakeProbe {
    fn new(observed_at: DateTime<Utc>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            probed: Mutex::new(Vec::new()),
            delay: None,
            observed_at,
        }
    }

    fn slow(observed_at: DateTime<Utc>, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(observed_at)
        }
    }
}

#[async_trait]
impl ProbeClient for FakeProbe {
    async fn probe(&self, route: &RouteCode, _window: &DateWindow) -> Result<Vec<PriceSample>, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.probed.lock().unwrap().push(route.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(vec![PriceSample {
            price: 250.0,
            reference_price: Some(300.0),
            carrier: "BA".into(),
            fare_class: "economy".into(),
            seats_available: Some(9),
            departure_date: None,
            observed_at: self.observed_at,
        }])
    }
}

#[derive(Default)]
struct RecordingSink {
    alerts: Mutex<Vec<String>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn notify(&self, route: &Route, _record: &DealAnalysisRecord) {
        self.alerts.lock().unwrap().push(route.code.to_string());
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

async fn build(
    config: Config,
    store: Arc<MemoryStore>,
    probe: Arc<FakeProbe>,
    sink: Arc<RecordingSink>,
) -> anyhow::Result<Service> {
    Service::with_collaborators(
        config,
        Collaborators {
            store,
            probe,
            oracle: None,
            alerts: sink,
        },
    )
    .await
}

#[tokio::test]
async fn test_tick_probes_due_routes_and_alerts() -> anyhow::Result<()> {
    let now = Utc::now();
    let store = Arc::new(
        MemoryStore::with_routes(vec![
            Route::new(RouteCode::new("JFK", "LHR"), Tier::High),
            Route::new(RouteCode::new("BOS", "SFO"), Tier::Low),
        ])
        .await,
    );
    let probe = Arc::new(FakeProbe::new(now));
    let sink = Arc::new(RecordingSink::default());
    let service = build(Config::default(), store.clone(), probe.clone(), sink.clone()).await?;

    let report = service.scheduler.tick(now).await?;
    assert_eq!(report.due, 2);
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.accepted, 2);
    assert_eq!(report.probe_calls, 2);
    assert_eq!(service.budget.consumed(), 2);
    assert_eq!(sink.alerts.lock().unwrap().len(), 2);
    assert_eq!(store.analyses().await.len(), 2);

    // Nothing is due again straight away
    let again = service.scheduler.tick(now).await?;
    assert_eq!(again.due, 0);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

    let route = store.route(&RouteCode::new("JFK", "LHR")).await.unwrap();
    assert_eq!(route.probe_count, 1);
    assert_eq!(route.accepted_deals, 1);
    assert_eq!(route.last_probe, Some(now));
    Ok(())
}

#[tokio::test]
async fn test_budget_cap_serves_high_tier_first() -> anyhow::Result<()> {
    let now = Utc::now();
    let store = Arc::new(
        MemoryStore::with_routes(vec![
            Route::new(RouteCode::new("BOS", "SFO"), Tier::Low),
            Route::new(RouteCode::new("JFK", "LHR"), Tier::High),
        ])
        .await,
    );
    let probe = Arc::new(FakeProbe::new(now));
    let mut config = Config::default();
    config.budget.monthly_allowance = 1;
    config.budget.safety_margin = 0.0;
    let service = build(config, store, probe.clone(), Arc::new(RecordingSink::default())).await?;

    let report = service.scheduler.tick(now).await?;
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.skipped_budget, 1);
    assert_eq!(service.budget.remaining(), 0);
    assert_eq!(
        probe.probed.lock().unwrap().as_slice(),
        &[RouteCode::new("JFK", "LHR")]
    );
    Ok(())
}

#[tokio::test]
async fn test_deadline_cancels_slow_probes() -> anyhow::Result<()> {
    let now = Utc::now();
    let code = RouteCode::new("JFK", "LHR");
    let store = Arc::new(MemoryStore::with_routes(vec![Route::new(code.clone(), Tier::High)]).await);
    let probe = Arc::new(FakeProbe::slow(now, Duration::from_secs(30)));
    let mut config = Config::default();
    config.scheduler.tick_deadline_secs = 1;
    let service = build(config, store.clone(), probe, Arc::new(RecordingSink::default())).await?;

    let report = service.scheduler.tick(now).await?;
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.failed, 1);
    // The call was fired before cancellation, so it stays spent
    assert_eq!(service.budget.consumed(), 1);

    let route = store.route(&code).await.unwrap();
    assert_eq!(route.consecutive_failures, 1);
    assert_eq!(route.last_attempt, Some(now));
    assert!(!service.registry.in_flight(&code));
    Ok(())
}

#[tokio::test]
async fn test_deadline_returns_unfired_reservations() -> anyhow::Result<()> {
    let now = Utc::now();
    let store = Arc::new(
        MemoryStore::with_routes(vec![
            Route::new(RouteCode::new("JFK", "LHR"), Tier::High),
            Route::new(RouteCode::new("BOS", "SFO"), Tier::High),
        ])
        .await,
    );
    let probe = Arc::new(FakeProbe::slow(now, Duration::from_secs(30)));
    let mut config = Config::default();
    config.scheduler.concurrency = 1;
    config.scheduler.tick_deadline_secs = 1;
    let service = build(config, store.clone(), probe.clone(), Arc::new(RecordingSink::default())).await?;

    let report = service.scheduler.tick(now).await?;
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.cancelled, 2);
    assert_eq!(report.failed, 2);
    // One job fired before the deadline; the queued one never did
    assert_eq!(report.probe_calls, 1);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert_eq!(service.budget.consumed(), 1);

    for code in [RouteCode::new("JFK", "LHR"), RouteCode::new("BOS", "SFO")] {
        let route = store.route(&code).await.unwrap();
        assert_eq!(route.consecutive_failures, 1);
        assert!(!service.registry.in_flight(&code));
    }
    Ok(())
}

#[tokio::test]
async fn test_budget_survives_restart() -> anyhow::Result<()> {
    let now = Utc::now();
    let store = Arc::new(
        MemoryStore::with_routes(vec![Route::new(RouteCode::new("JFK", "LHR"), Tier::High)]).await,
    );
    let probe = Arc::new(FakeProbe::new(now));

    let first = build(Config::default(), store.clone(), probe.clone(), Arc::new(RecordingSink::default())).await?;
    first.scheduler.tick(now).await?;
    let saved = store.load_budget().await?.expect("budget persisted after tick");
    assert_eq!(saved.consumed, 1);

    let second = build(Config::default(), store, probe, Arc::new(RecordingSink::default())).await?;
    assert_eq!(second.budget.consumed(), 1);
    Ok(())
}
