//! CLI interface for fare-watch

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::feedback::FeedbackError;
use crate::reliability::{Authority, OutcomeEvidence, OutcomeKind};
use crate::service::Service;
use crate::types::{Route, RouteCode, Tier};

#[derive(Parser)]
#[command(name = "fare-watch")]
#[command(about = "Adaptive fare scanner with deal reliability scoring", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "FARE_WATCH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log at info level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and feedback loop until Ctrl+C
    Run,
    /// Run a single scheduling tick and print what it did
    Tick {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Recompute thresholds from resolved outcomes and retune route tiers
    Retrain,
    /// Record what actually happened to an analysed fare
    Outcome {
        /// Analysis record id (printed with each deal alert)
        id: String,
        /// genuine, pricing-error or expired
        kind: OutcomeKind,
        /// user, recheck or booking
        #[arg(short, long, default_value = "user")]
        authority: Authority,
        /// The fare was actually booked
        #[arg(long)]
        booked: bool,
        /// Free-form note stored with the evidence
        #[arg(long)]
        note: Option<String>,
    },
    /// Show budget, thresholds and route counts
    Status,
    /// Manage monitored routes
    Routes {
        #[command(subcommand)]
        command: RouteCommands,
    },
    /// Inspect or initialise configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum RouteCommands {
    /// Add or update a route, e.g. `fare-watch routes add JFK-LHR --tier high`
    Add {
        route: RouteCode,
        #[arg(short, long, default_value = "medium")]
        tier: Tier,
        /// Explicit scans per day overriding the tier interval
        #[arg(long)]
        scans_per_day: Option<f64>,
        /// First day of the seasonal window (YYYY-MM-DD)
        #[arg(long, requires = "season_end")]
        season_start: Option<NaiveDate>,
        /// Last day of the seasonal window (YYYY-MM-DD)
        #[arg(long, requires = "season_start")]
        season_end: Option<NaiveDate>,
    },
    /// List routes with their schedule state
    List,
    /// Stop scanning a route
    Deactivate { route: RouteCode },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => config::config_path(),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load_from(path).with_context(|| format!("Failed to load config from {}", path.display()))
}

pub async fn run(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config)?;

    match cli.command {
        Commands::Run => {
            let service = Service::build(load_config(&config_path)?).await?;
            println!(
                "Scanning {} route(s) every {} minute(s). Press Ctrl+C to stop.",
                service.registry.routes().len(),
                service.config.scheduler.tick_minutes
            );
            service.run().await?;
        }
        Commands::Tick { json } => {
            let service = Service::build(load_config(&config_path)?).await?;
            let report = service.scheduler.tick(Utc::now()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
        }
        Commands::Retrain => {
            let service = Service::build(load_config(&config_path)?).await?;
            let report = service.feedback.retrain(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            let changes = service.feedback.tune_routes(&service.registry).await?;
            for change in &changes {
                match change.to {
                    Some(tier) => println!(
                        "{}: {} -> {} (deal rate {:.1}%)",
                        change.route, change.from, tier, change.deal_rate * 100.0
                    ),
                    None => println!(
                        "{}: deactivated (deal rate {:.1}%)",
                        change.route,
                        change.deal_rate * 100.0
                    ),
                }
            }
            if changes.is_empty() {
                println!("No route tier changes.");
            }
        }
        Commands::Outcome {
            id,
            kind,
            authority,
            booked,
            note,
        } => {
            let service = Service::build(load_config(&config_path)?).await?;
            let evidence = OutcomeEvidence {
                authority,
                booked,
                note,
            };
            match service.feedback.ingest_outcome(&id, kind, evidence).await {
                Ok(record) => println!(
                    "Recorded {:?} for {} ({} {}).",
                    kind, record.id, record.probe.route, record.decision
                ),
                Err(FeedbackError::Conflict { existing, .. }) => {
                    bail!("{} already resolved as {:?} with equal or higher authority", id, existing)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Status => {
            let service = Service::build(load_config(&config_path)?).await?;
            show_status(&service);
        }
        Commands::Routes { command } => {
            let service = Service::build(load_config(&config_path)?).await?;
            match command {
                RouteCommands::Add {
                    route,
                    tier,
                    scans_per_day,
                    season_start,
                    season_end,
                } => {
                    let mut new_route = match service.registry.get(&route) {
                        Some(mut existing) => {
                            existing.tier = tier;
                            existing.active = true;
                            existing.scans_per_day = None;
                            existing
                        }
                        None => Route::new(route.clone(), tier),
                    };
                    if let Some(scans) = scans_per_day {
                        new_route = new_route.with_scans_per_day(scans);
                    }
                    if let (Some(start), Some(end)) = (season_start, season_end) {
                        new_route = new_route.with_season(start, end);
                    }
                    service.registry.upsert_route(new_route).await?;
                    println!("Route {} saved ({} tier).", route, tier);
                }
                RouteCommands::List => list_routes(&service),
                RouteCommands::Deactivate { route } => {
                    if service.registry.deactivate(&route).await? {
                        println!("Route {} deactivated.", route);
                    } else {
                        bail!("Unknown route {}", route);
                    }
                }
            }
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let config = load_config(&config_path)?;
                println!("# {}", config_path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigCommands::Init { force } => {
                if config_path.exists() && !force {
                    bail!(
                        "{} already exists (use --force to overwrite)",
                        config_path.display()
                    );
                }
                Config::default().save_to(&config_path)?;
                println!("Wrote default config to {}", config_path.display());
            }
            ConfigCommands::Path => println!("{}", config_path.display()),
        },
    }

    Ok(())
}

fn show_status(service: &Service) {
    let budget = service.budget.snapshot();
    println!("fare-watch status");
    println!("=================");
    println!();
    println!(
        "Budget ({}): {} / {} used, {} remaining (allowance {})",
        budget.period_start.format("%Y-%m"),
        budget.consumed,
        budget.soft_ceiling,
        budget.remaining(),
        budget.allowance
    );

    let t = service.thresholds.load();
    println!();
    println!("Thresholds v{}:", t.version);
    println!("  suspicious discount: {:.0}%", t.suspicious_discount * 100.0);
    println!("  timing discount:     {:.0}%", t.timing_discount * 100.0);
    println!("  min accept score:    {:.1}", t.min_accept_score);
    println!("  ambiguous band:      [{:.0}, {:.0})", t.ambiguous_low, t.ambiguous_high);

    let routes = service.registry.routes();
    let active = routes.iter().filter(|r| r.active).count();
    let invalid = routes
        .iter()
        .filter(|r| service.registry.is_invalid(&r.code))
        .count();
    println!();
    println!(
        "Routes: {} total, {} active, {} invalid",
        routes.len(),
        active,
        invalid
    );
    for tier in [Tier::High, Tier::Medium, Tier::Low] {
        let count = routes.iter().filter(|r| r.active && r.tier == tier).count();
        println!("  {:<6} {}", tier, count);
    }
}

fn list_routes(service: &Service) {
    let routes = service.registry.routes();
    if routes.is_empty() {
        println!("No routes configured. Add one with `fare-watch routes add ORG-DST`.");
        return;
    }

    println!(
        "{:<9} {:<6} {:<8} {:<17} {:>6} {:>6} {:>8}",
        "ROUTE", "TIER", "STATE", "LAST PROBE", "PROBES", "DEALS", "FAILURES"
    );
    for route in routes {
        let state = if service.registry.is_invalid(&route.code) {
            "invalid"
        } else if !route.active {
            "inactive"
        } else if !route.in_season(Utc::now()) {
            "off-season"
        } else {
            "active"
        };
        let last = route
            .last_probe
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<9} {:<6} {:<8} {:<17} {:>6} {:>6} {:>8}",
            route.code.to_string(),
            route.tier.to_string(),
            state,
            last,
            route.probe_count,
            route.accepted_deals,
            route.consecutive_failures
        );
    }
}
