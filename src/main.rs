use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use listing_monitor::config::Config;
use listing_monitor::models::{CycleStats, ListingId};
use listing_monitor::monitor::{supervise, ForceOutcome, Monitor, Runner, StatsHistory};
use listing_monitor::scrapers::CentrisBrowserSource;
use listing_monitor::seen::{SeenStore, DEFAULT_BACKUP_KEEP};
use listing_monitor::sink::{self, Sink};

#[derive(Parser, Debug)]
#[command(name = "listing-monitor")]
#[command(about = "Watch the Centris Matrix portal and forward new listings to an API")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "LISTING_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging for this crate (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Skip listings submitted before this date (YYYY-MM-DD)
    #[arg(long, global = true)]
    since: Option<NaiveDate>,

    /// API endpoint receiving the records
    #[arg(long, global = true, env = "LISTING_MONITOR_ENDPOINT")]
    endpoint: Option<String>,

    /// Seen-set file
    #[arg(long, global = true)]
    seen_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single monitoring cycle
    Once,
    /// Run cycles continuously until interrupted
    Watch {
        /// Minutes between cycles
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Reprocess one listing even if it was already handled
    Force {
        id: String,
        /// Send the record to the API
        #[arg(long)]
        send: bool,
    },
    /// Forget every handled listing
    Reset {
        #[arg(long)]
        no_backup: bool,
    },
    /// Show the seen-set size and the last cycle
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    apply_overrides(&mut config, &cli);
    config.validate()?;

    match cli.command {
        Command::Once => run_once(&config).await,
        Command::Watch { .. } => run_watch(&config).await,
        Command::Force { ref id, send } => run_force(&config, &ListingId::from(id.as_str()), send).await,
        Command::Reset { no_backup } => run_reset(&config, no_backup),
        Command::Status => show_status(&config),
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default = if verbose { "info,listing_monitor=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(since) = cli.since {
        config.monitor.min_submitted_date = Some(since);
    }
    if let Some(endpoint) = &cli.endpoint {
        config.api.endpoint = Some(endpoint.clone());
    }
    if let Some(seen_file) = &cli.seen_file {
        config.monitor.seen_file = seen_file.clone();
    }
    if let Command::Watch { interval: Some(minutes) } = cli.command {
        config.monitor.interval_minutes = minutes;
    }
}

/// Launch the browser and load state from disk
fn open_session(config: &Config) -> Result<Monitor<'_, CentrisBrowserSource, Box<dyn Sink>>> {
    let source = CentrisBrowserSource::new(&config.monitor.portal_url, &config.browser)?;
    let sink = sink::from_config(&config.api)?;
    if config.api.endpoint.is_none() {
        info!("No API endpoint configured, records are kept locally only");
    }
    let seen = SeenStore::load(&config.monitor.seen_file);
    Ok(Monitor::new(config, source, sink, seen))
}

/// Flip to true on Ctrl+C
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current cycle");
            tx.send(true).ok();
        }
    });
    rx
}

async fn run_once(config: &Config) -> Result<()> {
    let mut monitor = open_session(config)?;
    let stats = monitor.run_cycle().await?;
    print_stats(&stats);
    Ok(())
}

async fn run_watch(config: &Config) -> Result<()> {
    info!("Centris listing monitor");
    info!("Checking every {} minutes", config.monitor.interval_minutes);
    if let Some(cutoff) = config.monitor.min_submitted_date {
        info!("Only listings submitted on or after {}", cutoff);
    }

    let shutdown = shutdown_signal();
    let summary = supervise(config.monitor.restart_backoff(), shutdown, |shutdown| async move {
        let monitor = open_session(config)?;
        let mut runner = Runner::new(monitor, config.monitor.interval());
        Ok::<_, anyhow::Error>(runner.run(shutdown).await?)
    })
    .await;

    info!(cycles = summary.cycles, "Monitor stopped");
    Ok(())
}

async fn run_force(config: &Config, id: &ListingId, send: bool) -> Result<()> {
    let mut monitor = open_session(config)?;
    match monitor.force(id, send).await? {
        ForceOutcome::Unavailable => println!("Listing {}: nothing could be extracted", id),
        ForceOutcome::IdentityMismatch { found } => {
            println!("Listing {}: the page showed listing {} instead, discarded", id, found)
        }
        ForceOutcome::Partial => println!("Listing {}: recorded, too little detail to send", id),
        ForceOutcome::Extracted(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        ForceOutcome::Delivered(delivery) => match delivery.status_code {
            Some(code) => println!("Listing {}: sent (HTTP {})", id, code),
            None => println!("Listing {}: recorded (no API endpoint configured)", id),
        },
        ForceOutcome::DeliveryFailed(e) => println!("Listing {}: delivery failed: {}", id, e),
    }
    Ok(())
}

fn run_reset(config: &Config, no_backup: bool) -> Result<()> {
    let mut seen = SeenStore::load(&config.monitor.seen_file);

    if !no_backup {
        if let Some(backup) = seen.backup(DEFAULT_BACKUP_KEEP)? {
            println!("Backup written to {}", backup.display());
        }
    }

    let forgotten = seen.len();
    seen.reset();
    seen.persist()
        .with_context(|| format!("Failed to write {}", seen.path().display()))?;
    println!("Seen-set reset: {} listings forgotten", forgotten);
    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    let seen = SeenStore::load(&config.monitor.seen_file);
    let history = StatsHistory::load(&config.monitor.stats_file, config.monitor.stats_history_len);

    println!("\nListing monitor status");
    println!("{}", "-".repeat(40));
    println!("{:<22} {}", "Seen-set file:", seen.path().display());
    println!("{:<22} {}", "Handled listings:", seen.len());
    if let Some(latest) = seen.iter().filter_map(|e| e.first_seen()).max() {
        println!("{:<22} {}", "Last handled at:", latest.format("%Y-%m-%d %H:%M:%S"));
    }
    println!(
        "{:<22} {}",
        "API endpoint:",
        config.api.endpoint.as_deref().unwrap_or("(none, local only)")
    );
    if let Some(cutoff) = config.monitor.min_submitted_date {
        println!("{:<22} {}", "Submitted since:", cutoff);
    }
    println!("{:<22} {}", "Recorded cycles:", history.entries().len());

    if let Some(last) = history.last() {
        println!("\nLast cycle");
        print_stats(last);
    }
    Ok(())
}

fn print_stats(stats: &CycleStats) {
    println!("{:<22} {}", "Time:", stats.timestamp.format("%Y-%m-%d %H:%M:%S"));
    println!("{:<22} {}", "Listings on portal:", stats.total_listings);
    println!("{:<22} {}", "New:", stats.new_listings);
    println!("{:<22} {}", "Extracted:", stats.scraped_successfully);
    println!("{:<22} {}", "Sent to API:", stats.sent_to_api);
    println!("{:<22} {}", "Errors:", stats.errors);
    if stats.delivery_failures > 0 {
        println!("{:<22} {}", "Delivery failures:", stats.delivery_failures);
    }
    if stats.filtered_out > 0 {
        println!("{:<22} {}", "Filtered by date:", stats.filtered_out);
    }
    if stats.partial > 0 {
        println!("{:<22} {}", "Without detail:", stats.partial);
    }
}
