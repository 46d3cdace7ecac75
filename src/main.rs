//! fare-watch - adaptive fare scanner
//!
//! Probes routes under a monthly call budget and scores the deals it finds.

use clap::Parser;
use fare_watch::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // WARN by default; --verbose raises to INFO, RUST_LOG overrides either
    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.into())
        )
        .init();

    cli::run(cli).await
}
