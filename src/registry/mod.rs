//! Route registry
//!
//! Holds the monitored routes, decides which are due, and hands out
//! single-flight probe leases so one route is never probed twice at once.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::desirability::WeightingFunction;
use crate::store::Store;
use crate::types::{Route, RouteCode, Tier};

/// Base intervals and guards for due-time computation
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalPolicy {
    pub high: Duration,
    pub medium: Duration,
    pub low: Duration,
    /// Floor on the effective interval
    pub min_interval: Duration,
    /// Max number of doublings applied for consecutive failures
    pub backoff_cap: u32,
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self {
            high: Duration::hours(5),
            medium: Duration::hours(12),
            low: Duration::hours(24),
            min_interval: Duration::minutes(30),
            backoff_cap: 3,
        }
    }
}

impl IntervalPolicy {
    pub fn tier_interval(&self, tier: Tier) -> Duration {
        match tier {
            Tier::High => self.high,
            Tier::Medium => self.medium,
            Tier::Low => self.low,
        }
    }

    /// Tier interval, or 24h / scans_per_day when the route overrides it
    pub fn base_interval(&self, route: &Route) -> Duration {
        match route.scans_per_day.filter(|s| s.is_finite() && *s > 0.0) {
            Some(scans) => Duration::milliseconds((86_400_000.0 / scans).round() as i64),
            None => self.tier_interval(route.tier),
        }
    }
}

/// Effective due interval at `now`; `None` when the route must not be probed
/// at all (inactive or out of season)
pub fn effective_interval(
    route: &Route,
    policy: &IntervalPolicy,
    weighting: &dyn WeightingFunction,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if !route.active || !route.in_season(now) {
        return None;
    }
    let weight = weighting.weight_at(now);
    let weight = if weight.is_finite() && weight > 0.0 { weight } else { 1.0 };
    let backoff = 1i64 << route.consecutive_failures.min(policy.backoff_cap).min(16);

    let base_ms = policy.base_interval(route).num_milliseconds() as f64;
    let ms = (base_ms * weight).round() as i64;
    let interval = Duration::milliseconds(ms.saturating_mul(backoff));
    Some(interval.max(policy.min_interval))
}

/// Whether `route` should be probed at `now`
pub fn is_due(
    route: &Route,
    policy: &IntervalPolicy,
    weighting: &dyn WeightingFunction,
    now: DateTime<Utc>,
) -> bool {
    let Some(interval) = effective_interval(route, policy, weighting, now) else {
        return false;
    };
    // A failed attempt counts as an attempt, so backoff is measured from it
    let reference = match (route.last_probe, route.last_attempt) {
        (Some(p), Some(a)) => Some(p.max(a)),
        (p, a) => p.or(a),
    };
    match reference {
        None => true,
        Some(at) => now - at >= interval,
    }
}

#[derive(Debug)]
struct RouteSlot {
    route: Route,
    /// (lease id, claimed at)
    lease: Option<(u64, DateTime<Utc>)>,
    invalid: Option<String>,
}

/// Exclusive right to probe one route. Dropping it releases the claim.
#[derive(Debug)]
pub struct ProbeLease {
    id: u64,
    route: Route,
    slot: Arc<Mutex<RouteSlot>>,
}

impl ProbeLease {
    /// Route as it was when the lease was claimed
    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn code(&self) -> &RouteCode {
        &self.route.code
    }
}

impl Drop for ProbeLease {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        // A reclaimed lease must not clear its successor's claim
        if matches!(slot.lease, Some((id, _)) if id == self.id) {
            slot.lease = None;
        }
    }
}

pub struct RouteRegistry {
    slots: RwLock<HashMap<RouteCode, Arc<Mutex<RouteSlot>>>>,
    store: Arc<dyn Store>,
    policy: IntervalPolicy,
    weighting: Arc<dyn WeightingFunction>,
    lease_timeout: Duration,
    next_lease: AtomicU64,
}

impl RouteRegistry {
    /// Load every stored route; invalid ones are flagged and logged once
    pub async fn load(
        store: Arc<dyn Store>,
        policy: IntervalPolicy,
        weighting: Arc<dyn WeightingFunction>,
        lease_timeout: Duration,
    ) -> Result<Self> {
        let routes = store.load_routes().await?;
        let mut slots = HashMap::with_capacity(routes.len());
        for route in routes {
            let invalid = route.validate().err();
            if let Some(reason) = &invalid {
                warn!("Route {} excluded from scheduling: {}", route.code, reason);
            }
            slots.insert(
                route.code.clone(),
                Arc::new(Mutex::new(RouteSlot {
                    route,
                    lease: None,
                    invalid,
                })),
            );
        }
        info!("Loaded {} route(s)", slots.len());

        Ok(Self {
            slots: RwLock::new(slots),
            store,
            policy,
            weighting,
            lease_timeout,
            next_lease: AtomicU64::new(1),
        })
    }

    pub fn policy(&self) -> &IntervalPolicy {
        &self.policy
    }

    /// Claim every due route not already in flight, sorted by tier.
    ///
    /// Idempotent across ticks: claims are released on drop and stale ones
    /// are reclaimed, so a crashed probe never loses a route.
    pub fn due_routes(&self, now: DateTime<Utc>) -> Vec<ProbeLease> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut leases = Vec::new();

        for slot_ref in slots.values() {
            let mut slot = slot_ref.lock().unwrap_or_else(|e| e.into_inner());
            if slot.invalid.is_some() {
                continue;
            }
            if let Some((_, since)) = slot.lease {
                if now - since < self.lease_timeout {
                    continue;
                }
                warn!(
                    "Reclaiming stale probe lease on {} (held since {})",
                    slot.route.code, since
                );
            }
            if !is_due(&slot.route, &self.policy, self.weighting.as_ref(), now) {
                continue;
            }

            let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
            slot.lease = Some((id, now));
            leases.push(ProbeLease {
                id,
                route: slot.route.clone(),
                slot: slot_ref.clone(),
            });
        }

        leases.sort_by_key(|lease| lease.route.tier);
        leases
    }

    /// Successful probe: bump counters and reset the failure streak
    pub async fn mark_probed(&self, code: &RouteCode, at: DateTime<Utc>, accepted: u64) -> Result<()> {
        self.store.record_probe(code, at, accepted).await?;
        if let Some(slot_ref) = self.slot(code) {
            let mut slot = slot_ref.lock().unwrap_or_else(|e| e.into_inner());
            let route = &mut slot.route;
            route.probe_count += 1;
            route.accepted_deals += accepted;
            route.last_probe = Some(at);
            route.last_attempt = Some(at);
            route.consecutive_failures = 0;
        }
        Ok(())
    }

    pub async fn record_failure(&self, code: &RouteCode, at: DateTime<Utc>) -> Result<()> {
        self.store.record_failure(code, at).await?;
        if let Some(slot_ref) = self.slot(code) {
            let mut slot = slot_ref.lock().unwrap_or_else(|e| e.into_inner());
            let route = &mut slot.route;
            route.failure_count += 1;
            route.consecutive_failures += 1;
            route.last_attempt = Some(at);
        }
        Ok(())
    }

    /// Exclude a route until a corrected version is upserted
    pub fn mark_invalid(&self, code: &RouteCode, reason: impl Into<String>) {
        let Some(slot_ref) = self.slot(code) else {
            return;
        };
        let mut slot = slot_ref.lock().unwrap_or_else(|e| e.into_inner());
        if slot.invalid.is_none() {
            let reason = reason.into();
            warn!("Route {} excluded from scheduling: {}", code, reason);
            slot.invalid = Some(reason);
        }
    }

    /// Insert a route or replace its definition. Clears any invalid flag.
    pub async fn upsert_route(&self, route: Route) -> Result<()> {
        if let Err(reason) = route.validate() {
            bail!("Route {} rejected: {}", route.code, reason);
        }
        self.store.upsert_route(&route).await?;

        let existing = {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            slots.get(&route.code).cloned()
        };
        match existing {
            Some(slot_ref) => {
                // Replace the definition, keep the live counters
                let mut slot = slot_ref.lock().unwrap_or_else(|e| e.into_inner());
                slot.route.tier = route.tier;
                slot.route.scans_per_day = route.scans_per_day;
                slot.route.active = route.active;
                slot.route.season = route.season;
                slot.invalid = None;
            }
            None => {
                let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
                slots.insert(
                    route.code.clone(),
                    Arc::new(Mutex::new(RouteSlot {
                        route,
                        lease: None,
                        invalid: None,
                    })),
                );
            }
        }
        Ok(())
    }

    /// Deactivate rather than delete. Returns false for an unknown route.
    pub async fn deactivate(&self, code: &RouteCode) -> Result<bool> {
        self.update_route(code, |route| route.active = false).await
    }

    /// Reassign tier and frequency override
    pub async fn set_schedule(&self, code: &RouteCode, tier: Tier, scans_per_day: Option<f64>) -> Result<bool> {
        self.update_route(code, |route| {
            route.tier = tier;
            route.scans_per_day = scans_per_day;
        })
        .await
    }

    async fn update_route<F>(&self, code: &RouteCode, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Route),
    {
        let Some(slot_ref) = self.slot(code) else {
            return Ok(false);
        };
        // Only the schedule fields go to the store; counters are owned by
        // record_probe/record_failure and may move while this write is pending
        let (tier, scans_per_day, active) = {
            let mut slot = slot_ref.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut slot.route);
            (slot.route.tier, slot.route.scans_per_day, slot.route.active)
        };
        self.store
            .update_schedule(code, tier, scans_per_day, active)
            .await
    }

    fn slot(&self, code: &RouteCode) -> Option<Arc<Mutex<RouteSlot>>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(code)
            .cloned()
    }

    pub fn get(&self, code: &RouteCode) -> Option<Route> {
        self.slot(code)
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).route.clone())
    }

    /// Snapshot of all routes, sorted by code
    pub fn routes(&self) -> Vec<Route> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut routes: Vec<Route> = slots
            .values()
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).route.clone())
            .collect();
        routes.sort_by(|a, b| a.code.cmp(&b.code));
        routes
    }

    pub fn is_invalid(&self, code: &RouteCode) -> bool {
        self.slot(code)
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).invalid.is_some())
            .unwrap_or(false)
    }

    pub fn in_flight(&self, code: &RouteCode) -> bool {
        self.slot(code)
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).lease.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetSnapshot;
    use crate::desirability::DesirabilityProfile;
    use crate::reliability::record::{DealAnalysisRecord, OutcomeRecord};
    use crate::reliability::score::CarrierTrackRecord;
    use crate::reliability::thresholds::ThresholdSet;
    use crate::store::{MemoryStore, OutcomeWrite};
    use chrono::{NaiveDate, TimeZone};

    // Tuesday 03:00 UTC: ultra band (x0.3)
    fn ultra_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 20, 3, 0, 0).unwrap()
    }

    // Friday noon UTC: standard band (x1.0)
    fn standard_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    fn route(origin: &str, destination: &str, tier: Tier) -> Route {
        Route::new(RouteCode::new(origin, destination), tier)
    }

    async fn registry(routes: Vec<Route>) -> (RouteRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_routes(routes).await);
        let registry = RouteRegistry::load(
            store.clone(),
            IntervalPolicy::default(),
            Arc::new(DesirabilityProfile::default()),
            Duration::minutes(15),
        )
        .await
        .unwrap();
        (registry, store)
    }

    #[test]
    fn test_ultra_band_shortens_interval() {
        let profile = DesirabilityProfile::default();
        let policy = IntervalPolicy::default();
        let now = ultra_time();
        let mut r = route("JFK", "LHR", Tier::High);

        assert_eq!(effective_interval(&r, &policy, &profile, now), Some(Duration::minutes(90)));

        r.last_probe = Some(now - Duration::hours(1));
        assert!(!is_due(&r, &policy, &profile, now));
        r.last_probe = Some(now - Duration::hours(2));
        assert!(is_due(&r, &policy, &profile, now));
    }

    #[test]
    fn test_standard_band_uses_tier_interval() {
        let profile = DesirabilityProfile::default();
        let policy = IntervalPolicy::default();
        let now = standard_time();
        let mut r = route("JFK", "LHR", Tier::High);

        r.last_probe = Some(now - Duration::hours(4));
        assert!(!is_due(&r, &policy, &profile, now));
        r.last_probe = Some(now - Duration::hours(5));
        assert!(is_due(&r, &policy, &profile, now));
    }

    #[test]
    fn test_min_interval_floor_and_backoff() {
        let profile = DesirabilityProfile::default();
        let policy = IntervalPolicy::default();
        let now = ultra_time();

        let busy = route("JFK", "LHR", Tier::High).with_scans_per_day(100.0);
        assert_eq!(effective_interval(&busy, &policy, &profile, now), Some(policy.min_interval));

        let mut failing = route("JFK", "LHR", Tier::High);
        failing.consecutive_failures = 2;
        assert_eq!(effective_interval(&failing, &policy, &profile, now), Some(Duration::minutes(360)));
        failing.consecutive_failures = 10;
        assert_eq!(effective_interval(&failing, &policy, &profile, now), Some(Duration::minutes(720)));
    }

    #[test]
    fn test_out_of_season_never_due() {
        let profile = DesirabilityProfile::default();
        let policy = IntervalPolicy::default();
        let d = |m, day| NaiveDate::from_ymd_opt(2026, m, day).unwrap();
        let summer = route("JFK", "CTA", Tier::Medium).with_season(d(6, 1), d(8, 31));

        assert_eq!(effective_interval(&summer, &policy, &profile, ultra_time()), None);
        assert!(!is_due(&summer, &policy, &profile, ultra_time()));
    }

    #[tokio::test]
    async fn test_due_routes_sorted_and_single_flight() {
        let (registry, _) = registry(vec![
            route("SFO", "NRT", Tier::Low),
            route("JFK", "LHR", Tier::High),
            route("BOS", "DUB", Tier::Medium),
        ])
        .await;
        let now = standard_time();

        let first = registry.due_routes(now);
        let tiers: Vec<Tier> = first.iter().map(|l| l.route().tier).collect();
        assert_eq!(tiers, vec![Tier::High, Tier::Medium, Tier::Low]);

        // Everything is in flight, a second claim gets nothing
        assert!(registry.due_routes(now).is_empty());

        drop(first);
        assert_eq!(registry.due_routes(now).len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_duplicate() {
        let (registry, _) = registry(vec![route("JFK", "LHR", Tier::High)]).await;
        let registry = Arc::new(registry);
        let now = standard_time();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let leases = registry.due_routes(now);
                    let n = leases.len();
                    // Hold the claim until every thread has tried
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    drop(leases);
                    n
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_stale_lease_reclaimed() {
        let (registry, _) = registry(vec![route("JFK", "LHR", Tier::High)]).await;
        let now = standard_time();
        let code = RouteCode::new("JFK", "LHR");

        let stuck = registry.due_routes(now);
        assert_eq!(stuck.len(), 1);
        assert!(registry.due_routes(now + Duration::minutes(10)).is_empty());

        let reclaimed = registry.due_routes(now + Duration::minutes(16));
        assert_eq!(reclaimed.len(), 1);

        // The old lease going away leaves the new claim in place
        drop(stuck);
        assert!(registry.in_flight(&code));
        drop(reclaimed);
        assert!(!registry.in_flight(&code));
    }

    #[tokio::test]
    async fn test_probe_and_failure_bookkeeping() {
        let (registry, store) = registry(vec![route("JFK", "LHR", Tier::High)]).await;
        let now = standard_time();
        let code = RouteCode::new("JFK", "LHR");

        let lease = registry.due_routes(now).pop().unwrap();
        registry.record_failure(lease.code(), now).await.unwrap();
        drop(lease);
        // Failed just now, backoff doubles the interval
        assert!(registry.due_routes(now + Duration::hours(6)).is_empty());

        // Saturday noon, reduced band: 5h x2 weight x2 backoff = 20h
        let later = now + Duration::hours(24);
        let lease = registry.due_routes(later).pop().unwrap();
        registry.mark_probed(lease.code(), later, 2).await.unwrap();
        drop(lease);

        let stored = store.route(&code).await.unwrap();
        assert_eq!(stored.probe_count, 1);
        assert_eq!(stored.accepted_deals, 2);
        assert_eq!(stored.failure_count, 1);
        assert_eq!(stored.consecutive_failures, 0);
        assert_eq!(registry.get(&code).unwrap(), stored);
    }

    #[tokio::test]
    async fn test_invalid_route_excluded_until_corrected() {
        let bad = route("JFK", "LHR", Tier::High).with_scans_per_day(-1.0);
        let (registry, _) = registry(vec![bad]).await;
        let code = RouteCode::new("JFK", "LHR");
        let now = standard_time();

        assert!(registry.is_invalid(&code));
        assert!(registry.due_routes(now).is_empty());

        assert!(registry
            .upsert_route(route("JFK", "LHR", Tier::High).with_scans_per_day(0.0))
            .await
            .is_err());

        registry.upsert_route(route("JFK", "LHR", Tier::High)).await.unwrap();
        assert!(!registry.is_invalid(&code));
        assert_eq!(registry.due_routes(now).len(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_and_reschedule() {
        let (registry, store) = registry(vec![route("JFK", "LHR", Tier::Low)]).await;
        let code = RouteCode::new("JFK", "LHR");

        assert!(registry.set_schedule(&code, Tier::High, Some(6.0)).await.unwrap());
        assert_eq!(store.route(&code).await.unwrap().tier, Tier::High);

        assert!(registry.deactivate(&code).await.unwrap());
        assert!(!store.route(&code).await.unwrap().active);
        assert!(registry.due_routes(standard_time()).is_empty());

        assert!(!registry.deactivate(&RouteCode::new("AAA", "BBB")).await.unwrap());
    }

    /// MemoryStore whose schedule writes stall, so counter updates can land mid-write
    struct StallingStore {
        inner: MemoryStore,
        stall: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl Store for StallingStore {
        async fn load_routes(&self) -> Result<Vec<Route>> {
            self.inner.load_routes().await
        }

        async fn upsert_route(&self, route: &Route) -> Result<()> {
            tokio::time::sleep(self.stall).await;
            self.inner.upsert_route(route).await
        }

        async fn update_schedule(
            &self,
            code: &RouteCode,
            tier: Tier,
            scans_per_day: Option<f64>,
            active: bool,
        ) -> Result<bool> {
            tokio::time::sleep(self.stall).await;
            self.inner.update_schedule(code, tier, scans_per_day, active).await
        }

        async fn record_probe(&self, code: &RouteCode, at: DateTime<Utc>, accepted: u64) -> Result<()> {
            self.inner.record_probe(code, at, accepted).await
        }

        async fn record_failure(&self, code: &RouteCode, at: DateTime<Utc>) -> Result<()> {
            self.inner.record_failure(code, at).await
        }

        async fn record_price(&self, code: &RouteCode, price: f64, at: DateTime<Utc>) -> Result<()> {
            self.inner.record_price(code, price, at).await
        }

        async fn average_price(&self, code: &RouteCode, since: DateTime<Utc>) -> Result<Option<f64>> {
            self.inner.average_price(code, since).await
        }

        async fn save_analysis(&self, record: &DealAnalysisRecord) -> Result<()> {
            self.inner.save_analysis(record).await
        }

        async fn get_analysis(&self, id: &str) -> Result<Option<DealAnalysisRecord>> {
            self.inner.get_analysis(id).await
        }

        async fn resolve_outcome(&self, id: &str, outcome: &OutcomeRecord) -> Result<OutcomeWrite> {
            self.inner.resolve_outcome(id, outcome).await
        }

        async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<DealAnalysisRecord>> {
            self.inner.resolved_since(since).await
        }

        async fn carrier_track_record(&self, carrier: &str) -> Result<CarrierTrackRecord> {
            self.inner.carrier_track_record(carrier).await
        }

        async fn load_thresholds(&self) -> Result<Option<ThresholdSet>> {
            self.inner.load_thresholds().await
        }

        async fn save_thresholds(&self, set: &ThresholdSet) -> Result<()> {
            self.inner.save_thresholds(set).await
        }

        async fn load_budget(&self) -> Result<Option<BudgetSnapshot>> {
            self.inner.load_budget().await
        }

        async fn save_budget(&self, snapshot: &BudgetSnapshot) -> Result<()> {
            self.inner.save_budget(snapshot).await
        }
    }

    #[tokio::test]
    async fn test_reschedule_keeps_concurrent_counters() {
        let code = RouteCode::new("JFK", "LHR");
        let store = Arc::new(StallingStore {
            inner: MemoryStore::with_routes(vec![route("JFK", "LHR", Tier::High)]).await,
            stall: std::time::Duration::from_millis(100),
        });
        let registry = Arc::new(
            RouteRegistry::load(
                store.clone(),
                IntervalPolicy::default(),
                Arc::new(DesirabilityProfile::default()),
                Duration::minutes(15),
            )
            .await
            .unwrap(),
        );

        let rescheduling = {
            let registry = registry.clone();
            let code = code.clone();
            tokio::spawn(async move { registry.set_schedule(&code, Tier::Medium, None).await })
        };
        // Let the reschedule reach its stalled store write
        tokio::task::yield_now().await;

        let now = standard_time();
        registry.mark_probed(&code, now, 1).await.unwrap();
        assert!(rescheduling.await.unwrap().unwrap());

        let stored = store.inner.route(&code).await.unwrap();
        assert_eq!(stored.tier, Tier::Medium);
        assert_eq!(stored.probe_count, 1);
        assert_eq!(stored.accepted_deals, 1);
        assert_eq!(stored.last_probe, Some(now));
        assert_eq!(registry.get(&code).unwrap(), stored);
    }

    #[tokio::test]
    async fn test_upsert_existing_route_keeps_counters() {
        let code = RouteCode::new("JFK", "LHR");
        let (registry, store) = registry(vec![route("JFK", "LHR", Tier::Low)]).await;
        let now = standard_time();
        registry.mark_probed(&code, now, 2).await.unwrap();

        // A definition built from scratch carries zeroed counters
        registry
            .upsert_route(route("JFK", "LHR", Tier::High).with_scans_per_day(3.0))
            .await
            .unwrap();

        let stored = store.route(&code).await.unwrap();
        assert_eq!(stored.tier, Tier::High);
        assert_eq!(stored.scans_per_day, Some(3.0));
        assert_eq!(stored.probe_count, 1);
        assert_eq!(stored.accepted_deals, 2);
        assert_eq!(stored.last_probe, Some(now));
        assert_eq!(registry.get(&code).unwrap(), stored);
    }
}
