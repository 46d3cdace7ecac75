//! Deal reliability engine
//!
//! Scores one price sample: detect suspicion factors, compute the score,
//! refer ambiguous cases to the oracle, decide, and persist the analysis
//! whatever the decision was.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::oracle::{consult, OracleContext, ReasoningOracle};
use super::record::{DealAnalysisRecord, Decision, OracleVerdict};
use super::score::reliability_score;
use super::suspicion::{detect, SuspicionContext};
use super::thresholds::{ThresholdHandle, ThresholdSet};
use crate::desirability::WeightingFunction;
use crate::store::Store;
use crate::types::{PriceSample, ProbeResult, Route};

/// Days of price history averaged for the historical baseline
pub const DEFAULT_HISTORY_DAYS: i64 = 30;

pub struct ReliabilityEngine {
    thresholds: Arc<ThresholdHandle>,
    weighting: Arc<dyn WeightingFunction>,
    oracle: Option<Arc<dyn ReasoningOracle>>,
    store: Arc<dyn Store>,
    oracle_timeout: Duration,
    history: ChronoDuration,
}

impl ReliabilityEngine {
    pub fn new(
        thresholds: Arc<ThresholdHandle>,
        weighting: Arc<dyn WeightingFunction>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            thresholds,
            weighting,
            oracle: None,
            store,
            oracle_timeout: Duration::from_secs(20),
            history: ChronoDuration::days(DEFAULT_HISTORY_DAYS),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ReasoningOracle>, timeout: Duration) -> Self {
        self.oracle = Some(oracle);
        self.oracle_timeout = timeout;
        self
    }

    pub fn with_history_days(mut self, days: i64) -> Self {
        self.history = ChronoDuration::days(days.max(1));
        self
    }

    pub fn thresholds(&self) -> &Arc<ThresholdHandle> {
        &self.thresholds
    }

    /// Score one sample and persist the resulting analysis record
    pub async fn evaluate(&self, route: &Route, sample: &PriceSample, now: DateTime<Utc>) -> Result<DealAnalysisRecord> {
        let historical_average = self
            .store
            .average_price(&route.code, now - self.history)
            .await?;
        let probe = ProbeResult::from_sample(&route.code, sample, historical_average);

        // One snapshot for the whole evaluation
        let thresholds = self.thresholds.load();
        let band = self.weighting.band_at(probe.observed_at);

        let factors = detect(
            &probe,
            &SuspicionContext {
                historical_average,
                band,
                thresholds: &thresholds,
                now,
            },
        );
        let carrier = self.store.carrier_track_record(&probe.carrier).await?;
        let score = reliability_score(&factors, &carrier, band);

        let (oracle, decision) = if thresholds.is_ambiguous(score) {
            match &self.oracle {
                Some(oracle) => {
                    let context = OracleContext {
                        probe: probe.clone(),
                        tier: route.tier,
                        historical_average,
                        band,
                        factors: factors.clone(),
                        score,
                    };
                    let verdict = consult(oracle.as_ref(), &context, self.oracle_timeout).await;
                    let decision = decide(score, Some(&verdict), &thresholds);
                    (Some(verdict), decision)
                }
                None => (None, Decision::Verify),
            }
        } else {
            (None, decide(score, None, &thresholds))
        };

        let record = DealAnalysisRecord {
            id: Uuid::new_v4().to_string(),
            probe,
            band,
            factors,
            score,
            oracle,
            decision,
            thresholds_version: thresholds.version,
            analyzed_at: now,
            outcome: None,
        };

        self.store.save_analysis(&record).await?;
        // Recorded after scoring so a fare never pulls its own baseline
        self.store
            .record_price(&route.code, record.probe.price, record.probe.observed_at)
            .await?;

        if record.decision == Decision::Accept {
            info!(
                "{} accepted at {:.2} ({:.0}% off, score {:.0})",
                route.code,
                record.probe.price,
                record.probe.discount * 100.0,
                record.score
            );
        } else {
            debug!(
                "{} {} at {:.2}: score {:.0}, {} factor(s)",
                route.code,
                record.decision,
                record.probe.price,
                record.score,
                record.factors.len()
            );
        }

        Ok(record)
    }
}

/// Accept iff the score clears the floor and any consulted oracle agreed
/// with enough confidence
pub fn decide(score: f64, verdict: Option<&OracleVerdict>, thresholds: &ThresholdSet) -> Decision {
    let oracle_ok = verdict
        .map(|v| v.is_legitimate && v.confidence >= thresholds.oracle_min_confidence)
        .unwrap_or(true);
    if score >= thresholds.min_accept_score && oracle_ok {
        Decision::Accept
    } else {
        Decision::Reject
    }
}
