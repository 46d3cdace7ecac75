//! fare-watch - Adaptive Fare Scanning Library
//!
//! Two cooperating halves:
//! - A scan scheduler that decides which routes to probe and when, under a
//!   monthly probe budget, weighted by how valuable the current time window is
//! - A deal reliability engine that scores each price it finds, refers
//!   ambiguous ones to a reasoning oracle, and retunes its thresholds from
//!   reported outcomes
//!
//! # Example
//!
//! ```ignore
//! use fare_watch::{Config, Service};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = Service::build(Config::load()?).await?;
//!     let report = service.scheduler.tick(chrono::Utc::now()).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod types;
pub mod budget;
pub mod desirability;
pub mod store;
pub mod registry;
pub mod probe;
pub mod reliability;
pub mod alerts;

// Loops and wiring
pub mod scheduler;
pub mod feedback;
pub mod config;
pub mod service;
pub mod cli;

// Re-export commonly used types for convenience
pub use types::{DateWindow, PriceSample, ProbeResult, Route, RouteCode, Tier};

pub use budget::{BudgetSnapshot, BudgetTracker};

pub use desirability::{DesirabilityBand, DesirabilityProfile, WeightingFunction};

pub use registry::{IntervalPolicy, ProbeLease, RouteRegistry};

pub use probe::{HttpProbeClient, ProbeClient, ProbeError};

pub use reliability::{
    DealAnalysisRecord,
    Decision,
    OutcomeKind,
    ReasoningOracle,
    ReliabilityEngine,
    ThresholdHandle,
    ThresholdSet,
};

pub use scheduler::{ScanScheduler, SchedulerSettings, TickReport};
pub use feedback::{FeedbackError, FeedbackLoop, LearningSettings};
pub use store::{MemoryStore, SqliteStore, Store};
pub use alerts::{AlertSink, LogAlertSink};
pub use config::Config;
pub use service::{Collaborators, Service};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Adaptive Fare Scanning Library", NAME, VERSION)
}
