//! Configuration management
//!
//! TOML file under the platform config dir (or an explicit path). A missing
//! file is created with defaults on first load.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::desirability::DesirabilityConfig;
use crate::feedback::LearningSettings;
use crate::registry::IntervalPolicy;
use crate::reliability::thresholds::ThresholdSet;
use crate::scheduler::{ProbeWindowSpec, SchedulerSettings};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub tiers: TiersConfig,
    #[serde(default)]
    pub desirability: DesirabilityConfig,
    /// Initial threshold set; a persisted set from retraining takes precedence
    #[serde(default)]
    pub thresholds: ThresholdSet,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Error)]
#[error("invalid [{section}] config: {message}")]
pub struct ConfigError {
    pub section: &'static str,
    pub message: String,
}

impl ConfigError {
    fn new(section: &'static str, message: impl Into<String>) -> Self {
        Self {
            section,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Probe calls the provider allows per calendar month
    #[serde(default = "default_monthly_allowance")]
    pub monthly_allowance: u64,
    /// Fraction of the allowance held back as headroom
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

fn default_monthly_allowance() -> u64 {
    10_000
}

fn default_safety_margin() -> f64 {
    0.10
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_allowance: default_monthly_allowance(),
            safety_margin: default_safety_margin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    #[serde(default = "default_high_hours")]
    pub high_interval_hours: f64,
    #[serde(default = "default_medium_hours")]
    pub medium_interval_hours: f64,
    #[serde(default = "default_low_hours")]
    pub low_interval_hours: f64,
    #[serde(default = "default_min_interval_minutes")]
    pub min_interval_minutes: u64,
    /// Max doublings of the interval for consecutive probe failures
    #[serde(default = "default_backoff_cap")]
    pub failure_backoff_cap: u32,
}

fn default_high_hours() -> f64 {
    5.0
}

fn default_medium_hours() -> f64 {
    12.0
}

fn default_low_hours() -> f64 {
    24.0
}

fn default_min_interval_minutes() -> u64 {
    30
}

fn default_backoff_cap() -> u32 {
    3
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            high_interval_hours: default_high_hours(),
            medium_interval_hours: default_medium_hours(),
            low_interval_hours: default_low_hours(),
            min_interval_minutes: default_min_interval_minutes(),
            failure_backoff_cap: default_backoff_cap(),
        }
    }
}

impl TiersConfig {
    pub fn policy(&self) -> IntervalPolicy {
        let hours = |h: f64| chrono::Duration::seconds((h * 3600.0).round() as i64);
        IntervalPolicy {
            high: hours(self.high_interval_hours),
            medium: hours(self.medium_interval_hours),
            low: hours(self.low_interval_hours),
            min_interval: chrono::Duration::minutes(self.min_interval_minutes as i64),
            backoff_cap: self.failure_backoff_cap,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_minutes")]
    pub tick_minutes: u64,
    /// Worker pool size (concurrent outbound probes)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_tick_deadline_secs")]
    pub tick_deadline_secs: u64,
    /// A probe lease older than this is reclaimed
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_probe_windows")]
    pub probe_windows: Vec<ProbeWindowSpec>,
}

fn default_tick_minutes() -> u64 {
    60
}

fn default_concurrency() -> usize {
    4
}

fn default_tick_deadline_secs() -> u64 {
    600
}

fn default_lease_timeout_secs() -> u64 {
    900
}

fn default_probe_windows() -> Vec<ProbeWindowSpec> {
    vec![ProbeWindowSpec::default()]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_minutes: default_tick_minutes(),
            concurrency: default_concurrency(),
            tick_deadline_secs: default_tick_deadline_secs(),
            lease_timeout_secs: default_lease_timeout_secs(),
            probe_windows: default_probe_windows(),
        }
    }
}

impl SchedulerConfig {
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: std::time::Duration::from_secs(self.tick_minutes * 60),
            concurrency: self.concurrency,
            tick_deadline: std::time::Duration::from_secs(self.tick_deadline_secs),
            windows: self.probe_windows.clone(),
        }
    }

    pub fn lease_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_timeout_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_retrain_hours")]
    pub retrain_hours: u64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_min_resolved")]
    pub min_resolved: usize,
    /// Max relative move of a threshold per retrain
    #[serde(default = "default_max_step")]
    pub max_step: f64,
    #[serde(default = "default_dominance_margin")]
    pub dominance_margin: f64,
    /// Deal rate at or above which a route moves up a tier
    #[serde(default = "default_promote_rate")]
    pub promote_rate: f64,
    /// Deal rate below which a route moves down a tier
    #[serde(default = "default_demote_rate")]
    pub demote_rate: f64,
    #[serde(default = "default_min_tuning_probes")]
    pub min_tuning_probes: u64,
    #[serde(default = "default_deactivate_after_probes")]
    pub deactivate_after_probes: u64,
}

fn default_retrain_hours() -> u64 {
    168
}

fn default_lookback_days() -> i64 {
    30
}

fn default_min_resolved() -> usize {
    10
}

fn default_max_step() -> f64 {
    0.05
}

fn default_dominance_margin() -> f64 {
    0.05
}

fn default_promote_rate() -> f64 {
    0.05
}

fn default_demote_rate() -> f64 {
    0.005
}

fn default_min_tuning_probes() -> u64 {
    20
}

fn default_deactivate_after_probes() -> u64 {
    200
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            retrain_hours: default_retrain_hours(),
            lookback_days: default_lookback_days(),
            min_resolved: default_min_resolved(),
            max_step: default_max_step(),
            dominance_margin: default_dominance_margin(),
            promote_rate: default_promote_rate(),
            demote_rate: default_demote_rate(),
            min_tuning_probes: default_min_tuning_probes(),
            deactivate_after_probes: default_deactivate_after_probes(),
        }
    }
}

impl LearningConfig {
    pub fn settings(&self) -> LearningSettings {
        LearningSettings {
            lookback_days: self.lookback_days,
            min_resolved: self.min_resolved,
            max_step: self.max_step,
            dominance_margin: self.dominance_margin,
            promote_rate: self.promote_rate,
            demote_rate: self.demote_rate,
            min_tuning_probes: self.min_tuning_probes,
            deactivate_after_probes: self.deactivate_after_probes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub enabled: bool,
    /// OpenAI-compatible base URL
    #[serde(default = "default_oracle_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    /// Environment variable holding the API key
    #[serde(default = "default_oracle_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,
}

fn default_oracle_endpoint() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_oracle_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_oracle_key_env() -> String {
    "FARE_WATCH_ORACLE_KEY".to_string()
}

fn default_oracle_timeout() -> u64 {
    20
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_oracle_endpoint(),
            model: default_oracle_model(),
            api_key_env: default_oracle_key_env(),
            timeout_secs: default_oracle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_probe_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

fn default_probe_endpoint() -> String {
    "http://localhost:8080".to_string()
}

fn default_probe_key_env() -> String {
    "FARE_WATCH_PROBE_KEY".to_string()
}

fn default_probe_timeout() -> u64 {
    30
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_probe_endpoint(),
            api_key_env: default_probe_key_env(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// JSON webhook for accepted deals; alerts are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path; defaults to the platform data dir
    #[serde(default)]
    pub database: Option<PathBuf>,
}

impl Config {
    /// Load from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load from `path`, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let margin = self.budget.safety_margin;
        if !(0.0..1.0).contains(&margin) {
            return Err(ConfigError::new("budget", format!("safety_margin {} must be in [0, 1)", margin)));
        }

        for (name, hours) in [
            ("high_interval_hours", self.tiers.high_interval_hours),
            ("medium_interval_hours", self.tiers.medium_interval_hours),
            ("low_interval_hours", self.tiers.low_interval_hours),
        ] {
            if !hours.is_finite() || hours <= 0.0 {
                return Err(ConfigError::new("tiers", format!("{} must be positive", name)));
            }
        }
        if self.tiers.min_interval_minutes == 0 {
            return Err(ConfigError::new("tiers", "min_interval_minutes must be positive"));
        }

        self.desirability
            .validate()
            .map_err(|e| ConfigError::new("desirability", e.to_string()))?;
        self.thresholds
            .validate()
            .map_err(|e| ConfigError::new("thresholds", e.to_string()))?;

        let s = &self.scheduler;
        if s.tick_minutes == 0 || s.tick_deadline_secs == 0 || s.lease_timeout_secs == 0 {
            return Err(ConfigError::new("scheduler", "tick, deadline and lease timeout must be positive"));
        }
        if s.concurrency == 0 {
            return Err(ConfigError::new("scheduler", "concurrency must be at least 1"));
        }
        if s.probe_windows.is_empty() {
            return Err(ConfigError::new("scheduler", "at least one probe window is required"));
        }

        let l = &self.learning;
        if !(l.max_step > 0.0 && l.max_step < 1.0) {
            return Err(ConfigError::new("learning", "max_step must be in (0, 1)"));
        }
        if l.retrain_hours == 0 || l.lookback_days <= 0 {
            return Err(ConfigError::new("learning", "retrain_hours and lookback_days must be positive"));
        }
        if l.demote_rate > l.promote_rate {
            return Err(ConfigError::new("learning", "demote_rate must not exceed promote_rate"));
        }

        Ok(())
    }

    /// Resolved SQLite path
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.database {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("fare-watch.db")),
        }
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "fare-watch", "fare-watch")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "fare-watch", "fare-watch")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}
