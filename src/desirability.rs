//! Desirability weighting
//!
//! Maps (hour-of-day, day-of-week) to a scan-interval multiplier. Windows
//! that historically surface more genuine mispricing get a small multiplier
//! (scan more often); overnight and weekend windows get a large one.
//!
//! Each (hour, day) falls into exactly one band. Rules are checked in order
//! and the first match wins; anything unmatched lands in the default band.
//! Multipliers are constant within a band and strictly increasing by band
//! rank, so no band boundary can produce a larger multiplier than a worse
//! neighbouring band.

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Named desirability band, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesirabilityBand {
    Ultra,
    Prime,
    Standard,
    Reduced,
}

impl DesirabilityBand {
    pub const ALL: [DesirabilityBand; 4] = [
        DesirabilityBand::Ultra,
        DesirabilityBand::Prime,
        DesirabilityBand::Standard,
        DesirabilityBand::Reduced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DesirabilityBand::Ultra => "ultra",
            DesirabilityBand::Prime => "prime",
            DesirabilityBand::Standard => "standard",
            DesirabilityBand::Reduced => "reduced",
        }
    }

    /// Windows that earn the timing bonus in reliability scoring
    pub fn is_high_value(&self) -> bool {
        matches!(self, DesirabilityBand::Ultra | DesirabilityBand::Prime)
    }

    /// Windows where a very deep discount is itself suspicious
    pub fn is_low_value(&self) -> bool {
        matches!(self, DesirabilityBand::Reduced)
    }
}

impl std::fmt::Display for DesirabilityBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pluggable weighting strategy used by the registry and the reliability engine
pub trait WeightingFunction: Send + Sync {
    /// Band for an hour (0-23, wrapped if larger) and weekday
    fn band(&self, hour: u32, day: Weekday) -> DesirabilityBand;

    /// Interval multiplier, always finite and > 0
    fn weight(&self, hour: u32, day: Weekday) -> f64;

    /// Offset applied before reading hour/day off a UTC instant
    fn utc_offset(&self) -> FixedOffset;

    fn band_at(&self, now: DateTime<Utc>) -> DesirabilityBand {
        let local = now.with_timezone(&self.utc_offset());
        self.band(local.hour(), local.weekday())
    }

    fn weight_at(&self, now: DateTime<Utc>) -> f64 {
        let local = now.with_timezone(&self.utc_offset());
        self.weight(local.hour(), local.weekday())
    }
}

/// Per-band multipliers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandMultipliers {
    #[serde(default = "default_ultra")]
    pub ultra: f64,
    #[serde(default = "default_prime")]
    pub prime: f64,
    #[serde(default = "default_standard")]
    pub standard: f64,
    #[serde(default = "default_reduced")]
    pub reduced: f64,
}

fn default_ultra() -> f64 {
    0.3
}

fn default_prime() -> f64 {
    0.6
}

fn default_standard() -> f64 {
    1.0
}

fn default_reduced() -> f64 {
    2.0
}

impl Default for BandMultipliers {
    fn default() -> Self {
        Self {
            ultra: default_ultra(),
            prime: default_prime(),
            standard: default_standard(),
            reduced: default_reduced(),
        }
    }
}

impl BandMultipliers {
    pub fn get(&self, band: DesirabilityBand) -> f64 {
        match band {
            DesirabilityBand::Ultra => self.ultra,
            DesirabilityBand::Prime => self.prime,
            DesirabilityBand::Standard => self.standard,
            DesirabilityBand::Reduced => self.reduced,
        }
    }
}

/// A (days, hour range) rule assigning a band. `end_hour` is exclusive;
/// `start_hour > end_hour` wraps past midnight on the same listed day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandRule {
    pub band: DesirabilityBand,
    /// Weekday names ("tue", "Tuesday") or "weekdays" / "weekends" / "all"
    pub days: Vec<String>,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl BandRule {
    fn new(band: DesirabilityBand, days: &[&str], start_hour: u32, end_hour: u32) -> Self {
        Self {
            band,
            days: days.iter().map(|d| d.to_string()).collect(),
            start_hour,
            end_hour,
        }
    }
}

/// `[desirability]` configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesirabilityConfig {
    /// Offset of the market's local time from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_band")]
    pub default_band: DesirabilityBand,
    #[serde(default)]
    pub multipliers: BandMultipliers,
    #[serde(default = "default_rules")]
    pub rules: Vec<BandRule>,
}

fn default_band() -> DesirabilityBand {
    DesirabilityBand::Reduced
}

fn default_rules() -> Vec<BandRule> {
    vec![
        BandRule::new(DesirabilityBand::Ultra, &["tue"], 0, 6),
        BandRule::new(DesirabilityBand::Prime, &["mon", "wed", "thu"], 0, 6),
        BandRule::new(DesirabilityBand::Standard, &["weekdays"], 6, 22),
    ]
}

impl Default for DesirabilityConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            default_band: default_band(),
            multipliers: BandMultipliers::default(),
            rules: default_rules(),
        }
    }
}

impl DesirabilityConfig {
    pub fn validate(&self) -> Result<()> {
        let mut previous: Option<(DesirabilityBand, f64)> = None;
        for band in DesirabilityBand::ALL {
            let m = self.multipliers.get(band);
            if !m.is_finite() || m <= 0.0 {
                bail!("multiplier for band '{}' must be positive and finite, got {}", band, m);
            }
            if let Some((prev_band, prev)) = previous {
                if m <= prev {
                    bail!(
                        "multiplier for band '{}' ({}) must exceed band '{}' ({})",
                        band, m, prev_band, prev
                    );
                }
            }
            previous = Some((band, m));
        }

        if self.utc_offset_minutes.abs() >= 24 * 60 {
            bail!("utc_offset_minutes must be within one day, got {}", self.utc_offset_minutes);
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.start_hour > 24 || rule.end_hour > 24 || rule.start_hour == rule.end_hour {
                bail!(
                    "rule {} has an invalid hour range {}..{}",
                    i, rule.start_hour, rule.end_hour
                );
            }
            if rule.days.is_empty() {
                bail!("rule {} lists no days", i);
            }
            parse_days(&rule.days)?;
        }
        Ok(())
    }
}

fn parse_days(days: &[String]) -> Result<[bool; 7]> {
    let mut mask = [false; 7];
    for day in days {
        match day.trim().to_lowercase().as_str() {
            "all" | "daily" => mask = [true; 7],
            "weekdays" => mask[..5].iter_mut().for_each(|d| *d = true),
            "weekends" => mask[5..].iter_mut().for_each(|d| *d = true),
            other => match Weekday::from_str(other) {
                Ok(wd) => mask[wd.num_days_from_monday() as usize] = true,
                Err(_) => bail!("unknown day '{}'", day),
            },
        }
    }
    Ok(mask)
}

#[derive(Debug, Clone)]
struct CompiledRule {
    band: DesirabilityBand,
    days: [bool; 7],
    start_hour: u32,
    end_hour: u32,
}

impl CompiledRule {
    fn matches(&self, hour: u32, day: Weekday) -> bool {
        if !self.days[day.num_days_from_monday() as usize] {
            return false;
        }
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Rule-table weighting function built from configuration
#[derive(Debug, Clone)]
pub struct DesirabilityProfile {
    offset: FixedOffset,
    default_band: DesirabilityBand,
    multipliers: BandMultipliers,
    rules: Vec<CompiledRule>,
}

impl DesirabilityProfile {
    pub fn from_config(config: &DesirabilityConfig) -> Result<Self> {
        config.validate()?;
        let offset = match FixedOffset::east_opt(config.utc_offset_minutes * 60) {
            Some(offset) => offset,
            None => bail!("invalid utc offset {} minutes", config.utc_offset_minutes),
        };
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    band: rule.band,
                    days: parse_days(&rule.days)?,
                    start_hour: rule.start_hour,
                    end_hour: rule.end_hour,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            offset,
            default_band: config.default_band,
            multipliers: config.multipliers.clone(),
            rules,
        })
    }

    pub fn multiplier(&self, band: DesirabilityBand) -> f64 {
        self.multipliers.get(band)
    }
}

impl Default for DesirabilityProfile {
    fn default() -> Self {
        let config = DesirabilityConfig::default();
        Self {
            offset: Utc.fix(),
            default_band: config.default_band,
            rules: config
                .rules
                .iter()
                .filter_map(|rule| {
                    parse_days(&rule.days).ok().map(|days| CompiledRule {
                        band: rule.band,
                        days,
                        start_hour: rule.start_hour,
                        end_hour: rule.end_hour,
                    })
                })
                .collect(),
            multipliers: config.multipliers,
        }
    }
}

impl WeightingFunction for DesirabilityProfile {
    fn band(&self, hour: u32, day: Weekday) -> DesirabilityBand {
        let hour = hour % 24;
        self.rules
            .iter()
            .find(|rule| rule.matches(hour, day))
            .map(|rule| rule.band)
            .unwrap_or(self.default_band)
    }

    fn weight(&self, hour: u32, day: Weekday) -> f64 {
        self.multipliers.get(self.band(hour, day))
    }

    fn utc_offset(&self) -> FixedOffset {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DAYS: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];

    #[test]
    fn test_canonical_bands_ordered() {
        let profile = DesirabilityProfile::default();
        let ultra = profile.weight(3, Weekday::Tue);
        let standard = profile.weight(12, Weekday::Wed);
        let reduced = profile.weight(12, Weekday::Sat);

        assert_eq!(profile.band(3, Weekday::Tue), DesirabilityBand::Ultra);
        assert_eq!(profile.band(12, Weekday::Wed), DesirabilityBand::Standard);
        assert_eq!(profile.band(12, Weekday::Sat), DesirabilityBand::Reduced);
        assert!(ultra < standard && standard < reduced);
    }

    #[test]
    fn test_total_function() {
        let profile = DesirabilityProfile::default();
        for day in DAYS {
            for hour in 0..48 {
                let w = profile.weight(hour, day);
                assert!(w.is_finite() && w > 0.0, "bad weight at {:?} {}", day, hour);
            }
        }
        assert_eq!(profile.band(27, Weekday::Tue), profile.band(3, Weekday::Tue));
    }

    #[test]
    fn test_weight_follows_band_rank() {
        let profile = DesirabilityProfile::default();
        for day in DAYS {
            for hour in 0..24 {
                for other_day in DAYS {
                    for other_hour in 0..24 {
                        let a = profile.band(hour, day);
                        let b = profile.band(other_hour, other_day);
                        if a < b {
                            assert!(profile.weight(hour, day) < profile.weight(other_hour, other_day));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_overnight_and_weekend_reduced() {
        let profile = DesirabilityProfile::default();
        assert_eq!(profile.band(23, Weekday::Wed), DesirabilityBand::Reduced);
        assert_eq!(profile.band(3, Weekday::Sun), DesirabilityBand::Reduced);
        assert_eq!(profile.band(4, Weekday::Mon), DesirabilityBand::Prime);
    }

    #[test]
    fn test_wrapping_rule() {
        let mut config = DesirabilityConfig::default();
        config.rules = vec![BandRule::new(DesirabilityBand::Prime, &["all"], 22, 2)];
        config.default_band = DesirabilityBand::Standard;
        let profile = DesirabilityProfile::from_config(&config).unwrap();
        assert_eq!(profile.band(23, Weekday::Fri), DesirabilityBand::Prime);
        assert_eq!(profile.band(1, Weekday::Fri), DesirabilityBand::Prime);
        assert_eq!(profile.band(2, Weekday::Fri), DesirabilityBand::Standard);
    }

    #[test]
    fn test_rejects_inverted_multipliers() {
        let mut config = DesirabilityConfig::default();
        config.multipliers.prime = 1.5;
        assert!(config.validate().is_err());

        let mut config = DesirabilityConfig::default();
        config.multipliers.ultra = 0.0;
        assert!(config.validate().is_err());

        let mut config = DesirabilityConfig::default();
        config.rules.push(BandRule::new(DesirabilityBand::Ultra, &["someday"], 1, 2));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_utc_offset_shifts_band() {
        let mut config = DesirabilityConfig::default();
        config.utc_offset_minutes = -5 * 60;
        let profile = DesirabilityProfile::from_config(&config).unwrap();
        // 08:00 UTC Tuesday is 03:00 Tuesday at UTC-5
        let now = Utc.with_ymd_and_hms(2026, 10, 20, 8, 0, 0).unwrap();
        assert_eq!(profile.band_at(now), DesirabilityBand::Ultra);
    }
}
