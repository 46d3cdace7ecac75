//! Composition root
//!
//! Builds every component once from `Config` with injected collaborators,
//! and runs the scheduler and feedback loops until Ctrl+C.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::alerts::{AlertFanout, AlertSink, LogAlertSink, WebhookAlertSink};
use crate::budget::BudgetTracker;
use crate::config::Config;
use crate::desirability::DesirabilityProfile;
use crate::feedback::FeedbackLoop;
use crate::probe::{HttpProbeClient, ProbeClient};
use crate::registry::RouteRegistry;
use crate::reliability::{HttpOracle, ReasoningOracle, ReliabilityEngine, ThresholdHandle};
use crate::scheduler::ScanScheduler;
use crate::store::{SqliteStore, Store};

/// External collaborators the core depends on
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub probe: Arc<dyn ProbeClient>,
    pub oracle: Option<Arc<dyn ReasoningOracle>>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Collaborators {
    /// Production collaborators described by `config`
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = SqliteStore::new(config.database_path()?).await?;

        let probe = HttpProbeClient::new(
            &config.probe.endpoint,
            std::env::var(&config.probe.api_key_env).ok(),
            Duration::from_secs(config.probe.timeout_secs),
        )?;

        let oracle: Option<Arc<dyn ReasoningOracle>> = if config.oracle.enabled {
            let key = std::env::var(&config.oracle.api_key_env).ok();
            if key.is_none() {
                warn!(
                    "Oracle enabled but {} is not set; requests will be unauthenticated",
                    config.oracle.api_key_env
                );
            }
            Some(Arc::new(HttpOracle::new(
                &config.oracle.endpoint,
                &config.oracle.model,
                key,
                Duration::from_secs(config.oracle.timeout_secs),
            )?))
        } else {
            None
        };

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
        if let Some(url) = &config.alerts.webhook_url {
            sinks.push(Arc::new(WebhookAlertSink::new(url)?));
        }

        Ok(Self {
            store: Arc::new(store),
            probe: Arc::new(probe),
            oracle,
            alerts: Arc::new(AlertFanout::new(sinks)),
        })
    }
}

pub struct Service {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub budget: Arc<BudgetTracker>,
    pub thresholds: Arc<ThresholdHandle>,
    pub registry: Arc<RouteRegistry>,
    pub engine: Arc<ReliabilityEngine>,
    pub scheduler: Arc<ScanScheduler>,
    pub feedback: Arc<FeedbackLoop>,
}

impl Service {
    pub async fn build(config: Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config).await?;
        Self::with_collaborators(config, collaborators).await
    }

    /// Wire the core around the given collaborators, restoring persisted
    /// budget and threshold state
    pub async fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            store,
            probe,
            oracle,
            alerts,
        } = collaborators;
        let now = Utc::now();

        let budget = Arc::new(BudgetTracker::new(
            config.budget.monthly_allowance,
            config.budget.safety_margin,
            now,
        ));
        if let Some(snapshot) = store.load_budget().await? {
            if budget.restore(&snapshot) {
                info!("Restored budget: {} of {} calls used", snapshot.consumed, budget.soft_ceiling());
            } else {
                info!("Discarded budget snapshot from {}", snapshot.period_start.format("%Y-%m"));
            }
        }

        let thresholds = match store.load_thresholds().await? {
            Some(set) if set.validate().is_ok() => {
                info!("Restored threshold set v{}", set.version);
                set
            }
            Some(set) => {
                warn!("Ignoring invalid persisted threshold set v{}", set.version);
                config.thresholds.clone()
            }
            None => config.thresholds.clone(),
        };
        let thresholds = Arc::new(ThresholdHandle::new(thresholds));

        let weighting = Arc::new(
            DesirabilityProfile::from_config(&config.desirability)
                .context("Invalid desirability configuration")?,
        );

        let registry = Arc::new(
            RouteRegistry::load(
                store.clone(),
                config.tiers.policy(),
                weighting.clone(),
                config.scheduler.lease_timeout(),
            )
            .await?,
        );

        let mut engine = ReliabilityEngine::new(thresholds.clone(), weighting, store.clone())
            .with_history_days(config.learning.lookback_days);
        if let Some(oracle) = oracle {
            engine = engine.with_oracle(oracle, Duration::from_secs(config.oracle.timeout_secs));
        }
        let engine = Arc::new(engine);

        let scheduler = Arc::new(ScanScheduler::new(
            registry.clone(),
            budget.clone(),
            probe,
            engine.clone(),
            alerts,
            store.clone(),
            config.scheduler.settings(),
        ));

        let feedback = Arc::new(FeedbackLoop::new(
            store.clone(),
            thresholds.clone(),
            config.learning.settings(),
        ));

        Ok(Self {
            config,
            store,
            budget,
            thresholds,
            registry,
            engine,
            scheduler,
            feedback,
        })
    }

    /// Run scheduler and feedback loops until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let scheduler = self.scheduler.clone();
        let scheduler_rx = shutdown_tx.subscribe();
        let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_rx).await });

        let feedback = self.feedback.clone();
        let registry = self.registry.clone();
        let period = Duration::from_secs(self.config.learning.retrain_hours * 3600);
        let feedback_rx = shutdown_tx.subscribe();
        let feedback_task = tokio::spawn(async move { feedback.run(registry, period, feedback_rx).await });

        info!("fare-watch running, press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        let _ = shutdown_tx.send(());

        if let Err(e) = scheduler_task.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        if let Err(e) = feedback_task.await {
            warn!("Feedback task ended abnormally: {}", e);
        }

        self.store.save_budget(&self.budget.snapshot()).await?;
        Ok(())
    }
}
