//! Tunable reliability thresholds
//!
//! The whole set is immutable once published; the feedback loop builds a new
//! set and swaps it in atomically, so a scoring call always sees one
//! consistent version.

use anyhow::{bail, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lowest value the suspicious-discount cutoff may be tightened to
pub const MIN_SUSPICIOUS_DISCOUNT: f64 = 0.30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    /// Discount fraction above which a fare is flagged as suspicious
    #[serde(default = "default_suspicious_discount")]
    pub suspicious_discount: f64,
    /// Discount that is "unusually large" for a low-value timing window
    #[serde(default = "default_timing_discount")]
    pub timing_discount: f64,
    /// Minimum reliability score for acceptance
    #[serde(default = "default_min_accept_score")]
    pub min_accept_score: f64,
    /// Scores in [ambiguous_low, ambiguous_high) are referred to the oracle
    #[serde(default = "default_ambiguous_low")]
    pub ambiguous_low: f64,
    #[serde(default = "default_ambiguous_high")]
    pub ambiguous_high: f64,
    /// Oracle confidence (0-100) needed to trust a "legitimate" answer
    #[serde(default = "default_oracle_min_confidence")]
    pub oracle_min_confidence: u8,
    /// Observations older than this are flagged as stale quotes
    #[serde(default = "default_max_quote_age_minutes")]
    pub max_quote_age_minutes: i64,
    /// Bumped on every swap
    #[serde(default)]
    pub version: u64,
}

fn default_suspicious_discount() -> f64 {
    0.60
}

fn default_timing_discount() -> f64 {
    0.45
}

fn default_min_accept_score() -> f64 {
    60.0
}

fn default_ambiguous_low() -> f64 {
    40.0
}

fn default_ambiguous_high() -> f64 {
    70.0
}

fn default_oracle_min_confidence() -> u8 {
    70
}

fn default_max_quote_age_minutes() -> i64 {
    180
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            suspicious_discount: default_suspicious_discount(),
            timing_discount: default_timing_discount(),
            min_accept_score: default_min_accept_score(),
            ambiguous_low: default_ambiguous_low(),
            ambiguous_high: default_ambiguous_high(),
            oracle_min_confidence: default_oracle_min_confidence(),
            max_quote_age_minutes: default_max_quote_age_minutes(),
            version: 0,
        }
    }
}

impl ThresholdSet {
    pub fn validate(&self) -> Result<()> {
        if !(self.suspicious_discount > 0.0 && self.suspicious_discount < 1.0) {
            bail!("suspicious_discount must be in (0, 1), got {}", self.suspicious_discount);
        }
        if !(self.timing_discount > 0.0 && self.timing_discount <= self.suspicious_discount) {
            bail!(
                "timing_discount must be in (0, suspicious_discount], got {}",
                self.timing_discount
            );
        }
        if !(0.0..=100.0).contains(&self.ambiguous_low)
            || !(0.0..=100.0).contains(&self.ambiguous_high)
            || self.ambiguous_low > self.ambiguous_high
        {
            bail!(
                "ambiguous band {}..{} must lie within 0..100",
                self.ambiguous_low, self.ambiguous_high
            );
        }
        if self.min_accept_score < self.ambiguous_low || self.min_accept_score > self.ambiguous_high {
            bail!(
                "min_accept_score {} must sit inside the ambiguous band {}..{}",
                self.min_accept_score, self.ambiguous_low, self.ambiguous_high
            );
        }
        if self.oracle_min_confidence > 100 {
            bail!("oracle_min_confidence must be <= 100");
        }
        if self.max_quote_age_minutes <= 0 {
            bail!("max_quote_age_minutes must be positive");
        }
        Ok(())
    }

    /// Score sits where the local evidence is not decisive
    pub fn is_ambiguous(&self, score: f64) -> bool {
        score >= self.ambiguous_low && score < self.ambiguous_high
    }
}

/// Shared, atomically swappable handle to the current threshold set
pub struct ThresholdHandle {
    current: ArcSwap<ThresholdSet>,
}

impl ThresholdHandle {
    pub fn new(initial: ThresholdSet) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Snapshot of the current set; never torn
    pub fn load(&self) -> Arc<ThresholdSet> {
        self.current.load_full()
    }

    /// Replace the set with `f(current)`, bumping the version.
    ///
    /// Uses read-copy-update, so two concurrent updaters cannot lose each
    /// other's change.
    pub fn update<F>(&self, mut f: F) -> Arc<ThresholdSet>
    where
        F: FnMut(&ThresholdSet) -> ThresholdSet,
    {
        let mut installed: Option<Arc<ThresholdSet>> = None;
        self.current.rcu(|current| {
            let mut next = f(current);
            next.version = current.version + 1;
            let next = Arc::new(next);
            installed = Some(next.clone());
            next
        });
        installed.unwrap_or_else(|| self.current.load_full())
    }

    /// Install a set verbatim (restoring persisted state)
    pub fn store(&self, set: ThresholdSet) {
        self.current.store(Arc::new(set));
    }
}

impl Default for ThresholdHandle {
    fn default() -> Self {
        Self::new(ThresholdSet::default())
    }
}
