//! Reliability scoring

use serde::{Deserialize, Serialize};

use super::record::SuspicionFactor;
use crate::desirability::DesirabilityBand;

/// Score of a fare with nothing suspicious about it
pub const BASELINE_SCORE: f64 = 80.0;

/// Points removed per severity point of each suspicion factor
pub const SEVERITY_PENALTY: f64 = 5.0;

/// Bound on the carrier track-record adjustment (either direction)
pub const MAX_CARRIER_ADJUSTMENT: f64 = 10.0;

/// Resolved records a carrier needs before its track record counts
pub const MIN_CARRIER_HISTORY: u64 = 5;

/// Bonus for fares seen in a high-desirability window
pub const TIMING_BONUS: f64 = 5.0;

/// Outcome history for one carrier
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CarrierTrackRecord {
    pub resolved: u64,
    pub genuine: u64,
}

impl CarrierTrackRecord {
    pub fn legitimacy_rate(&self) -> Option<f64> {
        if self.resolved == 0 {
            None
        } else {
            Some(self.genuine as f64 / self.resolved as f64)
        }
    }

    /// Bounded bonus/penalty; neutral until enough history exists
    pub fn adjustment(&self) -> f64 {
        if self.resolved < MIN_CARRIER_HISTORY {
            return 0.0;
        }
        self.legitimacy_rate()
            .map(|rate| ((rate - 0.5) * 2.0 * MAX_CARRIER_ADJUSTMENT).clamp(-MAX_CARRIER_ADJUSTMENT, MAX_CARRIER_ADJUSTMENT))
            .unwrap_or(0.0)
    }
}

/// Combine suspicion factors, carrier history, and timing into 0..=100
pub fn reliability_score(
    factors: &[SuspicionFactor],
    carrier: &CarrierTrackRecord,
    band: DesirabilityBand,
) -> f64 {
    let penalty: f64 = factors
        .iter()
        .map(|f| f.severity as f64 * SEVERITY_PENALTY)
        .sum();
    let timing = if band.is_high_value() { TIMING_BONUS } else { 0.0 };

    (BASELINE_SCORE - penalty + carrier.adjustment() + timing).clamp(0.0, 100.0)
}
