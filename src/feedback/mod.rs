//! Feedback learning loop
//!
//! Outcomes arrive after the fact and are attached to their analysis record
//! once (only stronger evidence may replace them). Periodic retraining turns
//! recent outcomes into small, bounded threshold nudges; route tuning turns
//! per-route deal rates into tier changes.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::registry::RouteRegistry;
use crate::reliability::record::{
    DealAnalysisRecord, Decision, OutcomeEvidence, OutcomeKind, OutcomeRecord,
};
use crate::reliability::thresholds::{ThresholdHandle, ThresholdSet, MIN_SUSPICIOUS_DISCOUNT};
use crate::store::{OutcomeWrite, Store};
use crate::types::{RouteCode, Tier};

/// Lowest value the acceptance floor may be loosened to
pub const MIN_ACCEPT_SCORE_FLOOR: f64 = 40.0;

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("analysis record {0} not found")]
    NotFound(String),
    #[error("analysis record {id} already carries a {existing:?} outcome of equal or higher authority")]
    Conflict { id: String, existing: OutcomeKind },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LearningSettings {
    pub lookback_days: i64,
    /// Resolved records needed before retraining touches anything
    pub min_resolved: usize,
    /// Max relative move of one threshold per retrain (0.05 = 5%)
    pub max_step: f64,
    /// How far one error rate must exceed the other to count as dominant
    pub dominance_margin: f64,
    pub promote_rate: f64,
    pub demote_rate: f64,
    /// Probes a route needs before tuning looks at it
    pub min_tuning_probes: u64,
    /// Probes without any deal after which a low-tier route is deactivated
    pub deactivate_after_probes: u64,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            min_resolved: 10,
            max_step: 0.05,
            dominance_margin: 0.05,
            promote_rate: 0.05,
            demote_rate: 0.005,
            min_tuning_probes: 20,
            deactivate_after_probes: 200,
        }
    }
}

/// Error-rate summary of a batch of resolved records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutcomeStats {
    pub resolved: usize,
    /// Resolved records with an accept or reject decision
    pub decided: usize,
    pub false_accepts: usize,
    pub false_rejects: usize,
    /// False rejects seen in the ultra or prime band
    pub false_rejects_high_value: usize,
}

impl OutcomeStats {
    pub fn from_records(records: &[DealAnalysisRecord]) -> Self {
        let mut stats = OutcomeStats {
            resolved: records.len(),
            ..Default::default()
        };
        for record in records {
            if record.decision == Decision::Verify {
                continue;
            }
            stats.decided += 1;
            if record.is_false_accept() {
                stats.false_accepts += 1;
            }
            if record.is_false_reject() {
                stats.false_rejects += 1;
                if record.band.is_high_value() {
                    stats.false_rejects_high_value += 1;
                }
            }
        }
        stats
    }

    pub fn false_accept_rate(&self) -> f64 {
        rate(self.false_accepts, self.decided)
    }

    pub fn false_reject_rate(&self) -> f64 {
        rate(self.false_rejects, self.decided)
    }

    /// Most false rejects happened in windows where deals are expected
    pub fn timing_aligned(&self) -> bool {
        self.false_rejects > 0 && self.false_rejects_high_value * 2 > self.false_rejects
    }
}

fn rate(n: usize, of: usize) -> f64 {
    if of == 0 {
        0.0
    } else {
        n as f64 / of as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    Unchanged { reason: String },
    TightenedDiscount { from: f64, to: f64 },
    LoosenedAcceptScore { from: f64, to: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrainReport {
    pub stats: OutcomeStats,
    pub adjustment: Adjustment,
    pub version: u64,
}

/// Compute the next threshold set from outcome stats, if any nudge applies.
///
/// Each step moves a threshold by at most `max_step` of its current value
/// and never past its floor.
pub fn nudge(current: &ThresholdSet, stats: &OutcomeStats, settings: &LearningSettings) -> Result<ThresholdSet, String> {
    if stats.decided < settings.min_resolved {
        return Err(format!(
            "{} decided outcome(s), need {}",
            stats.decided, settings.min_resolved
        ));
    }
    let fa = stats.false_accept_rate();
    let fr = stats.false_reject_rate();
    let step = settings.max_step.clamp(0.0, 1.0);

    if fa - fr > settings.dominance_margin {
        let to = (current.suspicious_discount * (1.0 - step)).max(MIN_SUSPICIOUS_DISCOUNT);
        if to >= current.suspicious_discount {
            return Err("suspicious discount already at its floor".into());
        }
        let mut next = current.clone();
        next.suspicious_discount = to;
        next.timing_discount = next.timing_discount.min(to);
        return Ok(next);
    }

    if fr - fa > settings.dominance_margin {
        if !stats.timing_aligned() {
            return Err("false rejects dominate but not in high-value windows".into());
        }
        let floor = MIN_ACCEPT_SCORE_FLOOR.max(current.ambiguous_low);
        let to = (current.min_accept_score * (1.0 - step)).max(floor);
        if to >= current.min_accept_score {
            return Err("acceptance score already at its floor".into());
        }
        let mut next = current.clone();
        next.min_accept_score = to;
        return Ok(next);
    }

    Err(format!(
        "no dominant error (false accept {:.1}%, false reject {:.1}%)",
        fa * 100.0,
        fr * 100.0
    ))
}

/// Per-route tier/activity change made by route tuning
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteChange {
    pub route: RouteCode,
    pub from: Tier,
    pub to: Option<Tier>,
    pub deal_rate: f64,
}

pub struct FeedbackLoop {
    store: Arc<dyn Store>,
    thresholds: Arc<ThresholdHandle>,
    settings: LearningSettings,
}

impl FeedbackLoop {
    pub fn new(store: Arc<dyn Store>, thresholds: Arc<ThresholdHandle>, settings: LearningSettings) -> Self {
        Self {
            store,
            thresholds,
            settings,
        }
    }

    /// Attach ground truth to a stored record
    pub async fn ingest_outcome(
        &self,
        record_id: &str,
        kind: OutcomeKind,
        evidence: OutcomeEvidence,
    ) -> Result<DealAnalysisRecord, FeedbackError> {
        let Some(record) = self.store.get_analysis(record_id).await? else {
            return Err(FeedbackError::NotFound(record_id.to_string()));
        };

        let outcome = OutcomeRecord {
            kind,
            verdict_correct: DealAnalysisRecord::judge(record.decision, kind),
            evidence,
            recorded_at: Utc::now(),
        };

        match self.store.resolve_outcome(record_id, &outcome).await? {
            OutcomeWrite::Written(record) => {
                info!(
                    "Outcome {:?} recorded for {} ({} {}, verdict correct: {:?})",
                    kind, record_id, record.probe.route, record.decision, outcome.verdict_correct
                );
                Ok(record)
            }
            OutcomeWrite::Conflict(existing) => {
                let existing = existing.outcome.map(|o| o.kind).unwrap_or(kind);
                warn!(
                    "Rejected duplicate outcome for {} (already {:?})",
                    record_id, existing
                );
                Err(FeedbackError::Conflict {
                    id: record_id.to_string(),
                    existing,
                })
            }
            OutcomeWrite::NotFound => Err(FeedbackError::NotFound(record_id.to_string())),
        }
    }

    /// Aggregate recent outcomes and nudge the thresholds
    pub async fn retrain(&self, now: DateTime<Utc>) -> Result<RetrainReport> {
        let since = now - Duration::days(self.settings.lookback_days.max(1));
        let records = self.store.resolved_since(since).await?;
        let stats = OutcomeStats::from_records(&records);

        self.adopt_persisted().await?;
        let current = self.thresholds.load();
        let next = match nudge(&current, &stats, &self.settings) {
            Ok(next) => next,
            Err(reason) => {
                debug!("Retrain left thresholds unchanged: {}", reason);
                return Ok(RetrainReport {
                    stats,
                    adjustment: Adjustment::Unchanged { reason },
                    version: current.version,
                });
            }
        };
        if let Err(e) = next.validate() {
            warn!("Retrain produced an invalid threshold set, keeping v{}: {}", current.version, e);
            return Ok(RetrainReport {
                stats,
                adjustment: Adjustment::Unchanged {
                    reason: e.to_string(),
                },
                version: current.version,
            });
        }

        let adjustment = if next.suspicious_discount != current.suspicious_discount {
            Adjustment::TightenedDiscount {
                from: current.suspicious_discount,
                to: next.suspicious_discount,
            }
        } else {
            Adjustment::LoosenedAcceptScore {
                from: current.min_accept_score,
                to: next.min_accept_score,
            }
        };

        let installed = self.thresholds.update(|_| next.clone());
        self.store.save_thresholds(&installed).await?;
        info!(
            "Thresholds v{} installed: {:?} (false accept {:.1}%, false reject {:.1}%)",
            installed.version,
            adjustment,
            stats.false_accept_rate() * 100.0,
            stats.false_reject_rate() * 100.0
        );

        Ok(RetrainReport {
            stats,
            adjustment,
            version: installed.version,
        })
    }

    /// Install a newer persisted set, e.g. one written by `fare-watch retrain`
    /// while this process was running
    async fn adopt_persisted(&self) -> Result<()> {
        let Some(persisted) = self.store.load_thresholds().await? else {
            return Ok(());
        };
        let current = self.thresholds.load();
        if persisted.version <= current.version {
            return Ok(());
        }
        if let Err(e) = persisted.validate() {
            warn!("Ignoring invalid persisted threshold set v{}: {}", persisted.version, e);
            return Ok(());
        }
        info!(
            "Adopting persisted threshold set v{} (was v{})",
            persisted.version, current.version
        );
        self.thresholds.store(persisted);
        Ok(())
    }

    /// Promote productive routes, demote or deactivate unproductive ones
    pub async fn tune_routes(&self, registry: &RouteRegistry) -> Result<Vec<RouteChange>> {
        let mut changes = Vec::new();

        for route in registry.routes() {
            if !route.active || route.probe_count < self.settings.min_tuning_probes {
                continue;
            }
            let deal_rate = route.deal_rate();

            let change = if deal_rate >= self.settings.promote_rate && route.tier != Tier::High {
                Some(route.tier.promoted())
            } else if deal_rate < self.settings.demote_rate {
                if route.tier == Tier::Low {
                    if route.accepted_deals == 0 && route.probe_count >= self.settings.deactivate_after_probes {
                        None
                    } else {
                        continue;
                    }
                } else {
                    Some(route.tier.demoted())
                }
            } else {
                continue;
            };

            match change {
                Some(tier) => {
                    registry.set_schedule(&route.code, tier, route.scans_per_day).await?;
                    info!("Route {} moved {} -> {} (deal rate {:.3})", route.code, route.tier, tier, deal_rate);
                }
                None => {
                    registry.deactivate(&route.code).await?;
                    info!(
                        "Route {} deactivated after {} probes without a deal",
                        route.code, route.probe_count
                    );
                }
            }
            changes.push(RouteChange {
                route: route.code.clone(),
                from: route.tier,
                to: change,
                deal_rate,
            });
        }

        Ok(changes)
    }

    /// Retrain and tune on a fixed period until shutdown
    pub async fn run(
        &self,
        registry: Arc<RouteRegistry>,
        period: std::time::Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("Feedback loop started (period: {:?})", period);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup does not retrain
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.retrain(Utc::now()).await {
                        error!("Retrain failed: {:#}", e);
                    }
                    if let Err(e) = self.tune_routes(&registry).await {
                        error!("Route tuning failed: {:#}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Feedback loop shutting down");
                    break;
                }
            }
        }
    }
}
