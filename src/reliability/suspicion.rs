//! Suspicion detection
//!
//! Pure checks over one probe result. Each check yields at most one factor.

use chrono::{DateTime, Duration, Utc};

use super::record::{SuspicionFactor, SuspicionKind};
use super::thresholds::ThresholdSet;
use crate::desirability::DesirabilityBand;
use crate::types::ProbeResult;

/// Flag a price below this fraction of the route's historical average
pub const HISTORICAL_FLOOR_FRACTION: f64 = 0.30;

/// Seat counts above this are not credible for a discounted fare bucket
const IMPLAUSIBLE_SEATS: u32 = 100;

/// Booking classes sold as first/business cabins
const PREMIUM_BOOKING_CODES: [&str; 5] = ["F", "A", "J", "C", "D"];

/// Inputs to detection beyond the probe result itself
#[derive(Debug, Clone, Copy)]
pub struct SuspicionContext<'a> {
    pub historical_average: Option<f64>,
    pub band: DesirabilityBand,
    pub thresholds: &'a ThresholdSet,
    pub now: DateTime<Utc>,
}

pub fn detect(probe: &ProbeResult, ctx: &SuspicionContext<'_>) -> Vec<SuspicionFactor> {
    [
        extreme_discount(probe, ctx),
        below_historical_average(probe, ctx),
        timing_inconsistency(probe, ctx),
        seat_availability(probe),
        stale_quote(probe, ctx),
        premium_cabin_discount(probe, ctx),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn extreme_discount(probe: &ProbeResult, ctx: &SuspicionContext<'_>) -> Option<SuspicionFactor> {
    let cutoff = ctx.thresholds.suspicious_discount;
    if probe.discount <= cutoff {
        return None;
    }
    // +1 severity for every 5 points past the cutoff
    let over = ((probe.discount - cutoff) * 20.0).floor() as i64;
    let severity = (6 + over).clamp(6, 10) as u8;
    Some(SuspicionFactor::new(
        SuspicionKind::ExtremeDiscount,
        severity,
        format!(
            "{:.0}% off exceeds the {:.0}% cutoff",
            probe.discount * 100.0,
            cutoff * 100.0
        ),
    ))
}

fn below_historical_average(probe: &ProbeResult, ctx: &SuspicionContext<'_>) -> Option<SuspicionFactor> {
    let average = ctx.historical_average.filter(|a| a.is_finite() && *a > 0.0)?;
    let floor = average * HISTORICAL_FLOOR_FRACTION;
    if probe.price >= floor {
        return None;
    }
    let ratio = probe.price / average;
    let severity = (5 + ((HISTORICAL_FLOOR_FRACTION - ratio) * 20.0).floor() as i64).clamp(5, 9) as u8;
    Some(SuspicionFactor::new(
        SuspicionKind::BelowHistoricalAverage,
        severity,
        format!(
            "price {:.2} is {:.0}% of the historical average {:.2}",
            probe.price,
            ratio * 100.0,
            average
        ),
    ))
}

fn timing_inconsistency(probe: &ProbeResult, ctx: &SuspicionContext<'_>) -> Option<SuspicionFactor> {
    if !ctx.band.is_low_value() || probe.discount < ctx.thresholds.timing_discount {
        return None;
    }
    Some(SuspicionFactor::new(
        SuspicionKind::TimingInconsistency,
        4,
        format!(
            "{:.0}% off observed in the {} window",
            probe.discount * 100.0,
            ctx.band
        ),
    ))
}

fn seat_availability(probe: &ProbeResult) -> Option<SuspicionFactor> {
    match probe.seats_available? {
        0 => Some(SuspicionFactor::new(
            SuspicionKind::SeatAvailability,
            8,
            "fare quoted with zero seats available",
        )),
        1 => Some(SuspicionFactor::new(
            SuspicionKind::SeatAvailability,
            3,
            "single seat left at this fare",
        )),
        n if n > IMPLAUSIBLE_SEATS => Some(SuspicionFactor::new(
            SuspicionKind::SeatAvailability,
            3,
            format!("{} seats reported in a discount bucket", n),
        )),
        _ => None,
    }
}

fn stale_quote(probe: &ProbeResult, ctx: &SuspicionContext<'_>) -> Option<SuspicionFactor> {
    let max_age = Duration::minutes(ctx.thresholds.max_quote_age_minutes);
    let age = ctx.now - probe.observed_at;
    if age <= max_age {
        return None;
    }
    let severity = if age > max_age * 4 { 7 } else { 4 };
    Some(SuspicionFactor::new(
        SuspicionKind::StaleQuote,
        severity,
        format!("quote is {} minutes old", age.num_minutes()),
    ))
}

fn premium_cabin_discount(probe: &ProbeResult, ctx: &SuspicionContext<'_>) -> Option<SuspicionFactor> {
    if !is_premium_cabin(&probe.fare_class) || probe.discount <= ctx.thresholds.suspicious_discount {
        return None;
    }
    Some(SuspicionFactor::new(
        SuspicionKind::PremiumCabinDiscount,
        3,
        format!("{} fare {:.0}% off", probe.fare_class, probe.discount * 100.0),
    ))
}

pub fn is_premium_cabin(fare_class: &str) -> bool {
    let trimmed = fare_class.trim();
    let lower = trimmed.to_lowercase();
    lower.contains("business")
        || lower.contains("first")
        || lower.contains("premium")
        || PREMIUM_BOOKING_CODES.contains(&trimmed)
}
