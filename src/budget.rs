//! Monthly probe-call budget
//!
//! Tracks calls consumed against a soft ceiling kept below the hard monthly
//! allowance. Reservation is a compare-and-reserve on an atomic counter, so
//! concurrent workers never oversubscribe; exhaustion is not an error, the
//! caller simply gets fewer calls than it asked for.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::info;

/// Persisted view of the current budget window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub period_start: DateTime<Utc>,
    pub allowance: u64,
    pub soft_ceiling: u64,
    pub consumed: u64,
}

impl BudgetSnapshot {
    pub fn remaining(&self) -> u64 {
        self.soft_ceiling.saturating_sub(self.consumed)
    }
}

/// Budget manager for external probe calls
pub struct BudgetTracker {
    allowance: u64,
    soft_ceiling: u64,
    consumed: AtomicU64,
    /// Held for reading by every reservation and for writing by rollover,
    /// so a reset can never interleave with a compare-and-reserve.
    period_start: RwLock<DateTime<Utc>>,
}

impl BudgetTracker {
    /// `safety_margin` is the fraction of the allowance held back (0.1 = 10%)
    pub fn new(allowance: u64, safety_margin: f64, now: DateTime<Utc>) -> Self {
        let margin = if safety_margin.is_finite() {
            safety_margin.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let soft_ceiling = ((allowance as f64) * (1.0 - margin)).floor() as u64;

        Self {
            allowance,
            soft_ceiling: soft_ceiling.min(allowance),
            consumed: AtomicU64::new(0),
            period_start: RwLock::new(period_start(now)),
        }
    }

    /// Reserve up to `n` calls; returns how many were granted (0..=n).
    ///
    /// A return of 0 means "skip this cycle".
    pub fn reserve(&self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        let _period = self.period_start.read().unwrap_or_else(|e| e.into_inner());
        let soft = self.soft_ceiling;

        match self.consumed.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            if used >= soft {
                None
            } else {
                Some(used + n.min(soft - used))
            }
        }) {
            Ok(previous) => n.min(soft - previous),
            Err(_) => 0,
        }
    }

    /// Hand back calls that were reserved but never fired
    pub fn release(&self, n: u64) {
        if n == 0 {
            return;
        }
        let _period = self.period_start.read().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(n))
            });
    }

    /// Calls still available under the soft ceiling
    pub fn remaining(&self) -> u64 {
        self.soft_ceiling
            .saturating_sub(self.consumed.load(Ordering::Acquire))
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    pub fn soft_ceiling(&self) -> u64 {
        self.soft_ceiling
    }

    pub fn allowance(&self) -> u64 {
        self.allowance
    }

    /// Reset the window if `now` has crossed into a later month.
    ///
    /// Idempotent: redundant calls within the same period do nothing.
    /// Returns true when a reset happened.
    pub fn rollover(&self, now: DateTime<Utc>) -> bool {
        let target = period_start(now);
        {
            let current = self.period_start.read().unwrap_or_else(|e| e.into_inner());
            if target <= *current {
                return false;
            }
        }

        let mut current = self.period_start.write().unwrap_or_else(|e| e.into_inner());
        if target <= *current {
            return false;
        }
        let spent = self.consumed.swap(0, Ordering::AcqRel);
        info!(
            "Budget window rolled over to {} ({} calls used in previous period)",
            target.format("%Y-%m"),
            spent
        );
        *current = target;
        true
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let period = self.period_start.read().unwrap_or_else(|e| e.into_inner());
        BudgetSnapshot {
            period_start: *period,
            allowance: self.allowance,
            soft_ceiling: self.soft_ceiling,
            consumed: self.consumed.load(Ordering::Acquire),
        }
    }

    /// Restore consumption from a persisted snapshot of the same period.
    ///
    /// Snapshots from another period are ignored. Returns true if applied.
    pub fn restore(&self, snapshot: &BudgetSnapshot) -> bool {
        let period = self.period_start.write().unwrap_or_else(|e| e.into_inner());
        if snapshot.period_start != *period {
            return false;
        }
        self.consumed
            .store(snapshot.consumed.min(self.allowance), Ordering::Release);
        true
    }
}

/// Midnight UTC on the first day of `now`'s month
pub fn period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_soft_ceiling_below_allowance() {
        let budget = BudgetTracker::new(1000, 0.1, at(2026, 10, 5));
        assert_eq!(budget.soft_ceiling(), 900);
        assert_eq!(budget.remaining(), 900);
    }

    #[test]
    fn test_reserve_never_exceeds_ceiling() {
        let budget = BudgetTracker::new(100, 0.2, at(2026, 10, 5));
        let mut granted = 0;
        for n in [7, 13, 1, 30, 25, 9, 40, 3, 0, 11] {
            let g = budget.reserve(n);
            assert!(g <= n);
            granted += g;
            assert!(granted <= budget.soft_ceiling());
        }
        assert_eq!(granted, 80);
        assert_eq!(budget.reserve(1), 0);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_partial_grant() {
        let budget = BudgetTracker::new(10, 0.0, at(2026, 10, 5));
        assert_eq!(budget.reserve(8), 8);
        assert_eq!(budget.reserve(5), 2);
        assert_eq!(budget.reserve(5), 0);
    }

    #[test]
    fn test_concurrent_reservations() {
        let budget = Arc::new(BudgetTracker::new(500, 0.1, at(2026, 10, 5)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = budget.clone();
                std::thread::spawn(move || (0..100).map(|_| budget.reserve(1)).sum::<u64>())
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 450);
        assert_eq!(budget.consumed(), 450);
    }

    #[test]
    fn test_release_returns_calls() {
        let budget = BudgetTracker::new(10, 0.0, at(2026, 10, 5));
        budget.reserve(6);
        budget.release(4);
        assert_eq!(budget.remaining(), 8);
        budget.release(100);
        assert_eq!(budget.consumed(), 0);
    }

    #[test]
    fn test_rollover_is_idempotent() {
        let budget = BudgetTracker::new(10, 0.0, at(2026, 10, 5));
        budget.reserve(10);

        assert!(!budget.rollover(at(2026, 10, 31)));
        assert_eq!(budget.remaining(), 0);

        assert!(budget.rollover(at(2026, 11, 1)));
        assert!(!budget.rollover(at(2026, 11, 1)));
        assert!(!budget.rollover(at(2026, 11, 20)));
        assert_eq!(budget.remaining(), 10);

        // Clock going backwards never resets
        assert!(!budget.rollover(at(2026, 9, 1)));
    }

    #[test]
    fn test_restore_same_period_only() {
        let budget = BudgetTracker::new(100, 0.0, at(2026, 10, 5));
        let mut snapshot = budget.snapshot();
        snapshot.consumed = 40;
        assert!(budget.restore(&snapshot));
        assert_eq!(budget.remaining(), 60);

        snapshot.period_start = period_start(at(2026, 9, 5));
        snapshot.consumed = 90;
        assert!(!budget.restore(&snapshot));
        assert_eq!(budget.remaining(), 60);
    }
}
