//! Persistence collaborator
//!
//! The core only needs read-by-filter, atomic counter increments and upsert.
//! `SqliteStore` is the durable backend; `MemoryStore` backs tests and
//! dry runs.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::budget::BudgetSnapshot;
use crate::reliability::record::{DealAnalysisRecord, OutcomeRecord};
use crate::reliability::score::CarrierTrackRecord;
use crate::reliability::thresholds::ThresholdSet;
use crate::types::{Route, RouteCode, Tier};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Result of a conditional outcome write
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeWrite {
    /// Outcome stored (first write, or strictly more authoritative evidence)
    Written(DealAnalysisRecord),
    /// Record already carries an outcome of equal or higher authority
    Conflict(DealAnalysisRecord),
    NotFound,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_routes(&self) -> Result<Vec<Route>>;

    /// Insert a route, or replace the definition of a stored one (tier,
    /// frequency override, active flag, season). Counters and probe
    /// timestamps of a stored route are never touched.
    async fn upsert_route(&self, route: &Route) -> Result<()>;

    /// Set tier, frequency override and active flag only.
    /// Returns false when the route is not stored.
    async fn update_schedule(
        &self,
        code: &RouteCode,
        tier: Tier,
        scans_per_day: Option<f64>,
        active: bool,
    ) -> Result<bool>;

    /// Atomically bump probe/deal counters, set last probe, clear the failure streak
    async fn record_probe(&self, code: &RouteCode, at: DateTime<Utc>, accepted: u64) -> Result<()>;

    /// Atomically bump failure counters and the last attempt time
    async fn record_failure(&self, code: &RouteCode, at: DateTime<Utc>) -> Result<()>;

    async fn record_price(&self, code: &RouteCode, price: f64, at: DateTime<Utc>) -> Result<()>;

    /// Mean observed price for a route since `since`
    async fn average_price(&self, code: &RouteCode, since: DateTime<Utc>) -> Result<Option<f64>>;

    async fn save_analysis(&self, record: &DealAnalysisRecord) -> Result<()>;

    async fn get_analysis(&self, id: &str) -> Result<Option<DealAnalysisRecord>>;

    /// Compare-and-set the outcome section of a record
    async fn resolve_outcome(&self, id: &str, outcome: &OutcomeRecord) -> Result<OutcomeWrite>;

    /// Records analysed since `since` that carry an outcome
    async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<DealAnalysisRecord>>;

    async fn carrier_track_record(&self, carrier: &str) -> Result<CarrierTrackRecord>;

    async fn load_thresholds(&self) -> Result<Option<ThresholdSet>>;

    async fn save_thresholds(&self, set: &ThresholdSet) -> Result<()>;

    async fn load_budget(&self) -> Result<Option<BudgetSnapshot>>;

    async fn save_budget(&self, snapshot: &BudgetSnapshot) -> Result<()>;
}

/// Decide whether `incoming` may replace the outcome already on `record`
pub(crate) fn may_supersede(record: &DealAnalysisRecord, incoming: &OutcomeRecord) -> bool {
    match &record.outcome {
        None => true,
        Some(existing) => incoming.evidence.authority > existing.evidence.authority,
    }
}
