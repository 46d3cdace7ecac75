//! Reasoning oracle collaborator
//!
//! The oracle is an external LLM consulted only for ambiguous scores. It is
//! treated as unreliable: any timeout, transport failure or unparseable
//! answer collapses to a conservative "not legitimate, zero confidence"
//! verdict instead of an error.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::record::{OracleVerdict, SuspicionFactor};
use crate::desirability::DesirabilityBand;
use crate::types::{ProbeResult, Tier};

/// Everything the oracle sees about one fare
#[derive(Debug, Clone, Serialize)]
pub struct OracleContext {
    pub probe: ProbeResult,
    pub tier: Tier,
    pub historical_average: Option<f64>,
    pub band: DesirabilityBand,
    pub factors: Vec<SuspicionFactor>,
    pub score: f64,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("oracle transport error: {0}")]
    Transport(String),
    #[error("oracle returned an unusable verdict: {0}")]
    Parse(String),
}

impl OracleError {
    /// Worth a second attempt within the same tick
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Timeout(_) | OracleError::Transport(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn judge(&self, context: &OracleContext) -> Result<OracleVerdict, OracleError>;
}

/// Ask the oracle with a per-attempt timeout and one retry on transient
/// failure. Never fails.
pub async fn consult(oracle: &dyn ReasoningOracle, context: &OracleContext, timeout: Duration) -> OracleVerdict {
    let mut last_error = None;

    for attempt in 1..=2 {
        let result = match tokio::time::timeout(timeout, oracle.judge(context)).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(timeout)),
        };

        match result {
            Ok(mut verdict) => {
                verdict.confidence = verdict.confidence.min(100);
                debug!(
                    "Oracle verdict for {}: legitimate={} confidence={}",
                    context.probe.route, verdict.is_legitimate, verdict.confidence
                );
                return verdict;
            }
            Err(e) => {
                let retry = e.is_transient() && attempt < 2;
                warn!(
                    "Oracle attempt {} for {} failed: {}{}",
                    attempt,
                    context.probe.route,
                    e,
                    if retry { ", retrying" } else { "" }
                );
                last_error = Some(e);
                if !retry {
                    break;
                }
            }
        }
    }

    OracleVerdict::conservative(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no answer".to_string()),
    )
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    is_legitimate: bool,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

/// Pull the JSON verdict object out of a model reply (tolerates code fences
/// and surrounding prose)
pub fn parse_verdict(text: &str) -> Result<OracleVerdict, OracleError> {
    let start = text
        .find('{')
        .ok_or_else(|| OracleError::Parse("no JSON object in reply".into()))?;
    let end = text
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| OracleError::Parse("unterminated JSON object".into()))?;

    let raw: RawVerdict = serde_json::from_str(&text[start..=end])
        .map_err(|e| OracleError::Parse(e.to_string()))?;
    if !raw.confidence.is_finite() {
        return Err(OracleError::Parse("confidence is not a number".into()));
    }

    Ok(OracleVerdict {
        is_legitimate: raw.is_legitimate,
        confidence: raw.confidence.clamp(0.0, 100.0).round() as u8,
        rationale: raw.rationale,
    })
}

const SYSTEM_PROMPT: &str = "You review airfare observations flagged by an automated deal detector. \
Decide whether the fare is a genuine, bookable deal or a pricing error, stale cache entry, or data glitch. \
Reply with only a JSON object: {\"is_legitimate\": bool, \"confidence\": 0-100, \"rationale\": string}.";

/// OpenAI-compatible chat-completions oracle
pub struct HttpOracle {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpOracle {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl ReasoningOracle for HttpOracle {
    async fn judge(&self, context: &OracleContext) -> Result<OracleVerdict, OracleError> {
        let user = serde_json::to_string_pretty(context)
            .map_err(|e| OracleError::Parse(e.to_string()))?;
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user },
            ],
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout(Duration::ZERO)
            } else {
                OracleError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Transport(format!("HTTP {}", status)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| OracleError::Parse(e.to_string()))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| OracleError::Parse("reply has no message content".into()))?;

        parse_verdict(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RouteCode;
    use chrono::Utc;

    fn context() -> OracleContext {
        OracleContext {
            probe: ProbeResult {
                route: RouteCode::new("JFK", "LHR"),
                price: 180.0,
                reference_price: Some(300.0),
                discount: 0.4,
                carrier: "BA".into(),
                fare_class: "economy".into(),
                seats_available: None,
                observed_at: Utc::now(),
            },
            tier: Tier::High,
            historical_average: Some(300.0),
            band: DesirabilityBand::Standard,
            factors: vec![],
            score: 55.0,
        }
    }

    #[test]
    fn test_parse_verdict_with_fences() {
        let reply = "```json\n{\"is_legitimate\": true, \"confidence\": 82.4, \"rationale\": \"fits sale\"}\n```";
        let verdict = parse_verdict(reply).unwrap();
        assert!(verdict.is_legitimate);
        assert_eq!(verdict.confidence, 82);
        assert_eq!(verdict.rationale, "fits sale");
    }

    #[test]
    fn test_parse_verdict_rejects_garbage() {
        assert!(matches!(parse_verdict("looks fine to me"), Err(OracleError::Parse(_))));
        assert!(matches!(parse_verdict("{\"is_legitimate\": \"yes\"}"), Err(OracleError::Parse(_))));
    }

    #[tokio::test]
    async fn test_consult_retries_transient_once() {
        let mut oracle = MockReasoningOracle::new();
        let mut calls = 0;
        oracle.expect_judge().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(OracleError::Transport("connection reset".into()))
            } else {
                Ok(OracleVerdict {
                    is_legitimate: true,
                    confidence: 90,
                    rationale: "ok".into(),
                })
            }
        });

        let verdict = consult(&oracle, &context(), Duration::from_secs(1)).await;
        assert!(verdict.is_legitimate);
        assert_eq!(verdict.confidence, 90);
    }

    #[tokio::test]
    async fn test_consult_parse_failure_is_conservative() {
        let mut oracle = MockReasoningOracle::new();
        oracle
            .expect_judge()
            .times(1)
            .returning(|_| Err(OracleError::Parse("bad".into())));

        let verdict = consult(&oracle, &context(), Duration::from_secs(1)).await;
        assert!(!verdict.is_legitimate);
        assert_eq!(verdict.confidence, 0);
        assert!(verdict.rationale.starts_with("oracle unavailable"));
    }

    struct SlowOracle;

    #[async_trait]
    impl ReasoningOracle for SlowOracle {
        async fn judge(&self, _context: &OracleContext) -> Result<OracleVerdict, OracleError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(OracleVerdict {
                is_legitimate: true,
                confidence: 100,
                rationale: "too late".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_consult_timeout_is_conservative() {
        let verdict = consult(&SlowOracle, &context(), Duration::from_millis(50)).await;
        assert!(!verdict.is_legitimate);
        assert_eq!(verdict.confidence, 0);
    }
}
