//! Deal reliability: suspicion detection, scoring, oracle referral and the
//! tunable thresholds the feedback loop adjusts.

pub mod engine;
pub mod oracle;
pub mod record;
pub mod score;
pub mod suspicion;
pub mod thresholds;

pub use engine::ReliabilityEngine;
pub use oracle::{HttpOracle, OracleContext, OracleError, ReasoningOracle};
pub use record::{
    Authority, DealAnalysisRecord, Decision, OracleVerdict, OutcomeEvidence, OutcomeKind,
    OutcomeRecord, SuspicionFactor, SuspicionKind,
};
pub use thresholds::{ThresholdHandle, ThresholdSet};
