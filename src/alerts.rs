//! Alert dispatch collaborator
//!
//! Accepted deals are handed to an `AlertSink`. Delivery is best effort and
//! never blocks or fails the scan tick.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::desirability::DesirabilityBand;
use crate::reliability::record::DealAnalysisRecord;
use crate::types::{Route, Tier};

/// Payload describing one accepted deal
#[derive(Debug, Clone, Serialize)]
pub struct DealAlert {
    pub record_id: String,
    pub route: String,
    pub tier: Tier,
    pub price: f64,
    pub reference_price: Option<f64>,
    pub discount_pct: f64,
    pub carrier: String,
    pub fare_class: String,
    pub score: f64,
    pub band: DesirabilityBand,
}

impl DealAlert {
    pub fn new(route: &Route, record: &DealAnalysisRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            route: route.code.to_string(),
            tier: route.tier,
            price: record.probe.price,
            reference_price: record.probe.reference_price,
            discount_pct: (record.probe.discount * 100.0).round(),
            carrier: record.probe.carrier.clone(),
            fare_class: record.probe.fare_class.clone(),
            score: record.score,
            band: record.band,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, route: &Route, record: &DealAnalysisRecord);

    fn name(&self) -> &'static str;
}

/// Writes alerts to the log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, route: &Route, record: &DealAnalysisRecord) {
        let alert = DealAlert::new(route, record);
        info!(
            "DEAL {} {} {:.2} ({}% off, score {:.0}) [{}]",
            alert.route, alert.carrier, alert.price, alert.discount_pct, alert.score, alert.record_id
        );
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// POSTs each alert as JSON to a webhook; delivery runs in its own task
pub struct WebhookAlertSink {
    client: Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, route: &Route, record: &DealAnalysisRecord) {
        let alert = DealAlert::new(route, record);
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            match client.post(&url).json(&alert).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => warn!(
                    "Webhook rejected alert {} with HTTP {}",
                    alert.record_id,
                    response.status()
                ),
                Err(e) => warn!("Webhook delivery for {} failed: {}", alert.record_id, e),
            }
        });
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Fans one alert out to several sinks
pub struct AlertFanout {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertFanout {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AlertSink for AlertFanout {
    async fn notify(&self, route: &Route, record: &DealAnalysisRecord) {
        for sink in &self.sinks {
            sink.notify(route, record).await;
        }
    }

    fn name(&self) -> &'static str {
        "fanout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::record::Decision;
    use crate::types::{ProbeResult, RouteCode};
    use chrono::Utc;

    fn record() -> DealAnalysisRecord {
        DealAnalysisRecord {
            id: "rec-1".into(),
            probe: ProbeResult {
                route: RouteCode::new("JFK", "LHR"),
                price: 210.0,
                reference_price: Some(420.0),
                discount: 0.5,
                carrier: "BA".into(),
                fare_class: "economy".into(),
                seats_available: Some(7),
                observed_at: Utc::now(),
            },
            band: DesirabilityBand::Prime,
            factors: vec![],
            score: 85.0,
            oracle: None,
            decision: Decision::Accept,
            thresholds_version: 3,
            analyzed_at: Utc::now(),
            outcome: None,
        }
    }

    #[test]
    fn test_alert_payload() {
        let route = Route::new(RouteCode::new("JFK", "LHR"), Tier::High);
        let alert = DealAlert::new(&route, &record());
        assert_eq!(alert.route, "JFK-LHR");
        assert_eq!(alert.discount_pct, 50.0);

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["tier"], "high");
        assert_eq!(json["band"], "prime");
    }

    #[test]
    fn test_log_sink_does_not_panic() {
        let route = Route::new(RouteCode::new("JFK", "LHR"), Tier::High);
        tokio_test::block_on(LogAlertSink.notify(&route, &record()));
    }
}
