//! In-memory store

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{may_supersede, OutcomeWrite, Store};
use crate::budget::BudgetSnapshot;
use crate::reliability::record::{DealAnalysisRecord, OutcomeKind, OutcomeRecord};
use crate::reliability::score::CarrierTrackRecord;
use crate::reliability::thresholds::ThresholdSet;
use crate::types::{Route, RouteCode, Tier};

#[derive(Default)]
struct MemoryState {
    routes: HashMap<RouteCode, Route>,
    prices: HashMap<RouteCode, Vec<(DateTime<Utc>, f64)>>,
    analyses: HashMap<String, DealAnalysisRecord>,
    thresholds: Option<ThresholdSet>,
    budget: Option<BudgetSnapshot>,
}

/// Non-durable store; every operation runs under one lock
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_routes(routes: Vec<Route>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock().await;
            for route in routes {
                state.routes.insert(route.code.clone(), route);
            }
        }
        store
    }

    /// Current stored copy of a route
    pub async fn route(&self, code: &RouteCode) -> Option<Route> {
        self.state.lock().await.routes.get(code).cloned()
    }

    pub async fn analyses(&self) -> Vec<DealAnalysisRecord> {
        let mut records: Vec<_> = self.state.lock().await.analyses.values().cloned().collect();
        records.sort_by_key(|r| r.analyzed_at);
        records
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_routes(&self) -> Result<Vec<Route>> {
        let mut routes: Vec<_> = self.state.lock().await.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(routes)
    }

    async fn upsert_route(&self, route: &Route) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.routes.get_mut(&route.code) {
            Some(stored) => {
                stored.tier = route.tier;
                stored.scans_per_day = route.scans_per_day;
                stored.active = route.active;
                stored.season = route.season;
            }
            None => {
                state.routes.insert(route.code.clone(), route.clone());
            }
        }
        Ok(())
    }

    async fn update_schedule(
        &self,
        code: &RouteCode,
        tier: Tier,
        scans_per_day: Option<f64>,
        active: bool,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.routes.get_mut(code) else {
            return Ok(false);
        };
        stored.tier = tier;
        stored.scans_per_day = scans_per_day;
        stored.active = active;
        Ok(true)
    }

    async fn record_probe(&self, code: &RouteCode, at: DateTime<Utc>, accepted: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(route) = state.routes.get_mut(code) {
            route.probe_count += 1;
            route.accepted_deals += accepted;
            route.last_probe = Some(at);
            route.last_attempt = Some(at);
            route.consecutive_failures = 0;
        }
        Ok(())
    }

    async fn record_failure(&self, code: &RouteCode, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(route) = state.routes.get_mut(code) {
            route.failure_count += 1;
            route.consecutive_failures += 1;
            route.last_attempt = Some(at);
        }
        Ok(())
    }

    async fn record_price(&self, code: &RouteCode, price: f64, at: DateTime<Utc>) -> Result<()> {
        self.state
            .lock()
            .await
            .prices
            .entry(code.clone())
            .or_default()
            .push((at, price));
        Ok(())
    }

    async fn average_price(&self, code: &RouteCode, since: DateTime<Utc>) -> Result<Option<f64>> {
        let state = self.state.lock().await;
        let prices: Vec<f64> = state
            .prices
            .get(code)
            .map(|p| p.iter().filter(|(at, _)| *at >= since).map(|(_, price)| *price).collect())
            .unwrap_or_default();
        if prices.is_empty() {
            return Ok(None);
        }
        Ok(Some(prices.iter().sum::<f64>() / prices.len() as f64))
    }

    async fn save_analysis(&self, record: &DealAnalysisRecord) -> Result<()> {
        self.state
            .lock()
            .await
            .analyses
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_analysis(&self, id: &str) -> Result<Option<DealAnalysisRecord>> {
        Ok(self.state.lock().await.analyses.get(id).cloned())
    }

    async fn resolve_outcome(&self, id: &str, outcome: &OutcomeRecord) -> Result<OutcomeWrite> {
        let mut state = self.state.lock().await;
        let Some(record) = state.analyses.get_mut(id) else {
            return Ok(OutcomeWrite::NotFound);
        };
        if !may_supersede(record, outcome) {
            return Ok(OutcomeWrite::Conflict(record.clone()));
        }
        record.outcome = Some(outcome.clone());
        Ok(OutcomeWrite::Written(record.clone()))
    }

    async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<DealAnalysisRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .analyses
            .values()
            .filter(|r| r.outcome.is_some() && r.analyzed_at >= since)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.analyzed_at);
        Ok(records)
    }

    async fn carrier_track_record(&self, carrier: &str) -> Result<CarrierTrackRecord> {
        let state = self.state.lock().await;
        let mut track = CarrierTrackRecord::default();
        for record in state.analyses.values().filter(|r| r.probe.carrier == carrier) {
            if let Some(outcome) = &record.outcome {
                track.resolved += 1;
                if outcome.kind == OutcomeKind::GenuineDeal {
                    track.genuine += 1;
                }
            }
        }
        Ok(track)
    }

    async fn load_thresholds(&self) -> Result<Option<ThresholdSet>> {
        Ok(self.state.lock().await.thresholds.clone())
    }

    async fn save_thresholds(&self, set: &ThresholdSet) -> Result<()> {
        self.state.lock().await.thresholds = Some(set.clone());
        Ok(())
    }

    async fn load_budget(&self) -> Result<Option<BudgetSnapshot>> {
        Ok(self.state.lock().await.budget.clone())
    }

    async fn save_budget(&self, snapshot: &BudgetSnapshot) -> Result<()> {
        self.state.lock().await.budget = Some(snapshot.clone());
        Ok(())
    }
}
