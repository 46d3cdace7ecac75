//! Shared types used across modules
//!
//! Routes, probe samples and the derived probe result live here so the
//! registry, scheduler and reliability engine can share them without
//! depending on each other.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Priority class of a route controlling its base scan interval.
///
/// Variants are declared in dispatch order, so sorting ascending puts
/// high-tier routes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        }
    }

    /// One step up, saturating at `High`
    pub fn promoted(self) -> Self {
        match self {
            Tier::Low => Tier::Medium,
            _ => Tier::High,
        }
    }

    /// One step down, saturating at `Low`
    pub fn demoted(self) -> Self {
        match self {
            Tier::High => Tier::Medium,
            _ => Tier::Low,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" | "h" => Ok(Tier::High),
            "medium" | "med" | "m" => Ok(Tier::Medium),
            "low" | "l" => Ok(Tier::Low),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Directed departure -> destination pair, e.g. `JFK-LHR`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteCode {
    pub origin: String,
    pub destination: String,
}

impl RouteCode {
    pub fn new(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
        }
    }

    /// Check both ends are 3-letter uppercase airport codes and differ
    pub fn validate(&self) -> Result<(), String> {
        for code in [&self.origin, &self.destination] {
            if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(format!("'{}' is not a 3-letter airport code", code));
            }
        }
        if self.origin == self.destination {
            return Err(format!("origin and destination are both {}", self.origin));
        }
        Ok(())
    }
}

impl std::fmt::Display for RouteCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.origin, self.destination)
    }
}

impl FromStr for RouteCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (origin, destination) = s
            .split_once('-')
            .ok_or_else(|| format!("route '{}' must look like ORG-DST", s))?;
        let code = RouteCode::new(origin.trim().to_uppercase(), destination.trim().to_uppercase());
        code.validate()?;
        Ok(code)
    }
}

/// Inclusive date range outside of which a seasonal route is never due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonalWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SeasonalWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// A monitored route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub code: RouteCode,
    pub tier: Tier,
    /// Overrides the tier base interval when set (24h / scans_per_day)
    #[serde(default)]
    pub scans_per_day: Option<f64>,
    #[serde(default)]
    pub last_probe: Option<DateTime<Utc>>,
    /// Last dispatch, successful or not
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probe_count: u64,
    #[serde(default)]
    pub accepted_deals: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub active: bool,
    #[serde(default)]
    pub season: Option<SeasonalWindow>,
}

impl Route {
    pub fn new(code: RouteCode, tier: Tier) -> Self {
        Self {
            code,
            tier,
            scans_per_day: None,
            last_probe: None,
            last_attempt: None,
            probe_count: 0,
            accepted_deals: 0,
            failure_count: 0,
            consecutive_failures: 0,
            active: true,
            season: None,
        }
    }

    pub fn with_season(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.season = Some(SeasonalWindow { start, end });
        self
    }

    pub fn with_scans_per_day(mut self, scans: f64) -> Self {
        self.scans_per_day = Some(scans);
        self
    }

    /// Required-field checks; a failing route is excluded from scheduling
    pub fn validate(&self) -> Result<(), String> {
        self.code.validate()?;
        if let Some(scans) = self.scans_per_day {
            if !scans.is_finite() || scans <= 0.0 {
                return Err(format!("scans_per_day must be positive, got {}", scans));
            }
        }
        if let Some(season) = &self.season {
            if season.start > season.end {
                return Err(format!(
                    "seasonal window starts {} after it ends {}",
                    season.start, season.end
                ));
            }
        }
        Ok(())
    }

    /// Whether the route is inside its seasonal window (always true when non-seasonal)
    pub fn in_season(&self, now: DateTime<Utc>) -> bool {
        self.season
            .map(|s| s.contains(now.date_naive()))
            .unwrap_or(true)
    }

    /// Accepted deals per probe; 0 for a never-probed route
    pub fn deal_rate(&self) -> f64 {
        if self.probe_count == 0 {
            0.0
        } else {
            self.accepted_deals as f64 / self.probe_count as f64
        }
    }
}

/// Departure-date range a single probe call covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub depart_from: NaiveDate,
    pub depart_to: NaiveDate,
}

impl DateWindow {
    /// Window starting `offset_days` after `today`, spanning `length_days` (min 1)
    pub fn ahead(today: NaiveDate, offset_days: u32, length_days: u32) -> Self {
        let depart_from = today + chrono::Days::new(offset_days as u64);
        let depart_to = depart_from + chrono::Days::new(length_days.max(1) as u64 - 1);
        Self { depart_from, depart_to }
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.depart_from, self.depart_to)
    }
}

/// Raw price observation as returned by the probe source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub price: f64,
    /// Published/base fare the source compares against, when it reports one
    #[serde(default)]
    pub reference_price: Option<f64>,
    pub carrier: String,
    pub fare_class: String,
    #[serde(default)]
    pub seats_available: Option<u32>,
    #[serde(default)]
    pub departure_date: Option<NaiveDate>,
    pub observed_at: DateTime<Utc>,
}

/// One price observation for a route, with its baseline and discount resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub route: RouteCode,
    pub price: f64,
    pub reference_price: Option<f64>,
    /// Fraction below the reference price, 0 when no reference is known
    pub discount: f64,
    pub carrier: String,
    pub fare_class: String,
    pub seats_available: Option<u32>,
    pub observed_at: DateTime<Utc>,
}

impl ProbeResult {
    /// Resolve the baseline: the source's reference price, else the route's
    /// historical average.
    pub fn from_sample(route: &RouteCode, sample: &PriceSample, historical_average: Option<f64>) -> Self {
        let reference_price = sample
            .reference_price
            .filter(|p| p.is_finite() && *p > 0.0)
            .or(historical_average.filter(|p| p.is_finite() && *p > 0.0));
        let discount = reference_price
            .map(|reference| (1.0 - sample.price / reference).clamp(0.0, 1.0))
            .unwrap_or(0.0);

        Self {
            route: route.clone(),
            price: sample.price,
            reference_price,
            discount,
            carrier: sample.carrier.clone(),
            fare_class: sample.fare_class.clone(),
            seats_available: sample.seats_available,
            observed_at: sample.observed_at,
        }
    }
}
