//! Deal analysis records and their delayed outcome section

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::desirability::DesirabilityBand;
use crate::types::ProbeResult;

/// Kind of anomaly flagged against a probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionKind {
    /// Discount fraction above the suspicious cutoff
    ExtremeDiscount,
    /// Price far below the route's historical average
    BelowHistoricalAverage,
    /// Unusually deep discount seen in a low-value timing window
    TimingInconsistency,
    /// Seat count that does not fit a real fare (zero, one, or implausibly many)
    SeatAvailability,
    /// Observation older than the maximum quote age, likely a cache artifact
    StaleQuote,
    /// Premium cabin discounted past the cutoff
    PremiumCabinDiscount,
}

impl std::fmt::Display for SuspicionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SuspicionKind::ExtremeDiscount => "extreme_discount",
            SuspicionKind::BelowHistoricalAverage => "below_historical_average",
            SuspicionKind::TimingInconsistency => "timing_inconsistency",
            SuspicionKind::SeatAvailability => "seat_availability",
            SuspicionKind::StaleQuote => "stale_quote",
            SuspicionKind::PremiumCabinDiscount => "premium_cabin_discount",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspicionFactor {
    pub kind: SuspicionKind,
    /// 1 (mild) to 10 (near certain error)
    pub severity: u8,
    pub detail: String,
}

impl SuspicionFactor {
    pub fn new(kind: SuspicionKind, severity: u8, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity: severity.clamp(1, 10),
            detail: detail.into(),
        }
    }
}

/// Final decision for a probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
    /// Ambiguous and no oracle was available to settle it
    Verify,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::Reject => "reject",
            Decision::Verify => "verify",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured verdict returned by the reasoning oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub is_legitimate: bool,
    /// 0-100
    pub confidence: u8,
    pub rationale: String,
}

impl OracleVerdict {
    /// Stand-in used whenever the oracle times out or answers garbage
    pub fn conservative(reason: impl std::fmt::Display) -> Self {
        Self {
            is_legitimate: false,
            confidence: 0,
            rationale: format!("oracle unavailable: {}", reason),
        }
    }
}

/// What actually happened to an alerted (or rejected) fare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Fare was real and bookable
    GenuineDeal,
    /// Fare was a pricing error or was cancelled by the carrier
    PricingError,
    /// Fare had vanished by the time anyone looked (cache artifact)
    Expired,
}

impl std::str::FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "genuine" | "genuine_deal" => Ok(OutcomeKind::GenuineDeal),
            "pricing_error" | "error" => Ok(OutcomeKind::PricingError),
            "expired" => Ok(OutcomeKind::Expired),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// How trustworthy a piece of outcome evidence is; later variants win
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    UserReport,
    AutomatedRecheck,
    BookingConfirmed,
}

impl Authority {
    pub fn rank(&self) -> i64 {
        match self {
            Authority::UserReport => 1,
            Authority::AutomatedRecheck => 2,
            Authority::BookingConfirmed => 3,
        }
    }
}

impl std::str::FromStr for Authority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "user" | "user_report" => Ok(Authority::UserReport),
            "recheck" | "automated_recheck" => Ok(Authority::AutomatedRecheck),
            "booking" | "booking_confirmed" => Ok(Authority::BookingConfirmed),
            other => Err(format!("unknown authority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvidence {
    pub authority: Authority,
    #[serde(default)]
    pub booked: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// Ground truth attached to a record after the fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub kind: OutcomeKind,
    pub evidence: OutcomeEvidence,
    /// None when the decision was `Verify`
    pub verdict_correct: Option<bool>,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted result of scoring one probe result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealAnalysisRecord {
    pub id: String,
    pub probe: ProbeResult,
    pub band: DesirabilityBand,
    pub factors: Vec<SuspicionFactor>,
    /// 0-100
    pub score: f64,
    pub oracle: Option<OracleVerdict>,
    pub decision: Decision,
    pub thresholds_version: u64,
    pub analyzed_at: DateTime<Utc>,
    #[serde(default)]
    pub outcome: Option<OutcomeRecord>,
}

impl DealAnalysisRecord {
    /// Whether the stored decision matched what actually happened
    pub fn judge(decision: Decision, outcome: OutcomeKind) -> Option<bool> {
        match decision {
            Decision::Accept => Some(outcome == OutcomeKind::GenuineDeal),
            Decision::Reject => Some(outcome != OutcomeKind::GenuineDeal),
            Decision::Verify => None,
        }
    }

    /// Accepted, but the fare turned out not to be real
    pub fn is_false_accept(&self) -> bool {
        self.decision == Decision::Accept
            && matches!(
                self.outcome.as_ref().map(|o| o.kind),
                Some(OutcomeKind::PricingError)
            )
    }

    /// Rejected, but the fare was genuine
    pub fn is_false_reject(&self) -> bool {
        self.decision == Decision::Reject
            && matches!(
                self.outcome.as_ref().map(|o| o.kind),
                Some(OutcomeKind::GenuineDeal)
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_judge() {
        assert_eq!(DealAnalysisRecord::judge(Decision::Accept, OutcomeKind::GenuineDeal), Some(true));
        assert_eq!(DealAnalysisRecord::judge(Decision::Accept, OutcomeKind::PricingError), Some(false));
        assert_eq!(DealAnalysisRecord::judge(Decision::Reject, OutcomeKind::GenuineDeal), Some(false));
        assert_eq!(DealAnalysisRecord::judge(Decision::Reject, OutcomeKind::Expired), Some(true));
        assert_eq!(DealAnalysisRecord::judge(Decision::Verify, OutcomeKind::GenuineDeal), None);
    }

    #[test]
    fn test_authority_order() {
        assert!(Authority::UserReport < Authority::AutomatedRecheck);
        assert!(Authority::AutomatedRecheck < Authority::BookingConfirmed);
        assert_eq!("booking".parse::<Authority>().unwrap(), Authority::BookingConfirmed);
        assert_eq!("pricing-error".parse::<OutcomeKind>().unwrap(), OutcomeKind::PricingError);
    }

    #[test]
    fn test_severity_clamped() {
        assert_eq!(SuspicionFactor::new(SuspicionKind::StaleQuote, 0, "").severity, 1);
        assert_eq!(SuspicionFactor::new(SuspicionKind::StaleQuote, 42, "").severity, 10);
    }
}
