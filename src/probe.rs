//! Flight-price probe collaborator
//!
//! The price source is a black box: one call per route and date window,
//! returning zero or more price samples. Each call costs one unit of the
//! monthly budget.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::types::{DateWindow, PriceSample, RouteCode};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe transport error: {0}")]
    Transport(String),
    #[error("probe source rate limited")]
    RateLimited,
    #[error("probe source rejected the route: {0}")]
    InvalidRoute(String),
    #[error("malformed probe response: {0}")]
    Malformed(String),
}

impl ProbeError {
    /// Worth one retry inside the same tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProbeError::Timeout(_) | ProbeError::Transport(_) | ProbeError::RateLimited
        )
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn probe(&self, route: &RouteCode, window: &DateWindow) -> Result<Vec<PriceSample>, ProbeError>;
}

/// Map a non-success HTTP status onto the error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> ProbeError {
    match status.as_u16() {
        429 => ProbeError::RateLimited,
        400 | 404 | 422 => ProbeError::InvalidRoute(format!("HTTP {}: {}", status, body.trim())),
        408 | 504 => ProbeError::Timeout(Duration::ZERO),
        _ => ProbeError::Transport(format!("HTTP {}", status)),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProbeResponse {
    Wrapped { samples: Vec<PriceSample> },
    Bare(Vec<PriceSample>),
}

impl ProbeResponse {
    fn into_samples(self) -> Vec<PriceSample> {
        match self {
            ProbeResponse::Wrapped { samples } | ProbeResponse::Bare(samples) => samples,
        }
    }
}

/// JSON-over-HTTP price source
///
/// `GET {endpoint}/prices?origin=..&destination=..&depart_from=..&depart_to=..`
pub struct HttpProbeClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpProbeClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn probe(&self, route: &RouteCode, window: &DateWindow) -> Result<Vec<PriceSample>, ProbeError> {
        let depart_from = window.depart_from.to_string();
        let depart_to = window.depart_to.to_string();
        let mut request = self
            .client
            .get(format!("{}/prices", self.endpoint))
            .query(&[
                ("origin", route.origin.as_str()),
                ("destination", route.destination.as_str()),
                ("depart_from", depart_from.as_str()),
                ("depart_to", depart_to.as_str()),
            ]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: ProbeResponse = response
            .json()
            .await
            .map_err(|e| ProbeError::Malformed(e.to_string()))?;
        let samples = parsed.into_samples();
        debug!("Probe {} {} returned {} sample(s)", route, window, samples.len());

        for sample in &samples {
            if !sample.price.is_finite() || sample.price <= 0.0 {
                return Err(ProbeError::Malformed(format!("non-positive price {}", sample.price)));
            }
        }
        Ok(samples)
    }
}
