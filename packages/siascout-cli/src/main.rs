//! SIA-Scout CLI - threat intelligence scanner for IP address space
//!
//! This binary wires configuration and arguments into the core pipeline:
//! - Authenticate against the intelligence API (token cached on disk)
//! - Collect current listings for the configured CIDR targets
//! - Collect historical listings over a lookback window
//! - Report over previously stored results

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use siascout_core::{api, auth, config, report, scan, store};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Parser)]
#[command(name = "siascout")]
#[command(version)]
#[command(about = "Threat intelligence scanner for IP address space")]
#[command(long_about = "
SIA-Scout enumerates CIDR blocks from a target list, queries the
intelligence API for each /24 sub-block and stores matching listings in a
local SQLite database. Live collections are cache-aware and resumable;
historical collections always re-query the requested window.

Quick start:
  1. Export credentials:  SIASCOUT_USERNAME / SIASCOUT_PASSWORD
  2. Collect listings:    siascout collect
  3. Read the report:     siascout report
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Target list file (one CIDR per line, # comments allowed)
    #[arg(short, long, global = true)]
    targets: Option<PathBuf>,

    /// Database file path
    #[arg(short, long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect current listings for the target blocks (cache-aware)
    Collect,

    /// Collect historical listings over a lookback window (never cached)
    CollectHistory {
        /// Days to look back (the API caps windows at 12 months)
        #[arg(long, default_value_t = config::DEFAULT_HISTORY_DAYS)]
        days: u64,
    },

    /// Show account usage and limit figures
    Limits,

    /// Summarize stored results
    Report {
        /// Read the historical table instead of the live one
        #[arg(long)]
        history: bool,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("siascout={},siascout_core={}", log_level, log_level).into()
            }),
        )
        .with_target(false)
        .init();

    let mut cfg = config::load_config()?;
    if let Some(targets) = cli.targets {
        cfg.target_file = targets;
    }
    if let Some(db) = cli.db {
        cfg.db_path = db;
    }

    match cli.command {
        Commands::Collect => cmd_collect(&cfg, api::ScanKind::Live).await,
        Commands::CollectHistory { days } => {
            let until = chrono::Utc::now().timestamp();
            let since = until - (days as i64) * 86_400;
            cmd_collect(&cfg, api::ScanKind::History { since, until }).await
        }
        Commands::Limits => cmd_limits(&cfg).await,
        Commands::Report { history } => cmd_report(&cfg, history).await,
        Commands::Config => cmd_config(&cfg),
    }
}

/// Authenticate and build the shared API session. Any authentication
/// failure is fatal for the process.
async fn authenticate(cfg: &config::Config) -> Result<api::ApiClient> {
    let creds = config::Credentials::from_env()
        .context("Set SIASCOUT_USERNAME and SIASCOUT_PASSWORD in the environment")?;

    let http = reqwest::Client::new();
    let token = match auth::obtain(&http, cfg, &creds).await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!("CRITICAL: {}", e);
            return Err(e).context("Authentication failed; cannot proceed");
        }
    };
    api::ApiClient::new(&cfg.api_url, &token)
}

async fn cmd_collect(cfg: &config::Config, kind: api::ScanKind) -> Result<()> {
    let client = authenticate(cfg).await?;

    // Informational only; a failure here never blocks the scan
    println!("--- Checking Account Status ---");
    match client.check_limits().await {
        Ok(limits_report) => println!("{}", limits_report),
        Err(e) => tracing::warn!("Could not retrieve limits: {}", e),
    }

    let store = store::Store::open(&cfg.db_path)?;
    let query = api::Query {
        dataset: cfg.dataset.clone(),
        mode: cfg.mode.clone(),
        limit: cfg.limit,
        kind,
    };

    let collector = scan::Collector::new(
        Arc::new(client),
        store,
        query,
        cfg.target_file.clone(),
        cfg.concurrency,
    );

    // Let in-flight requests finish on Ctrl-C, then wind down cleanly
    let cancel = collector.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight requests");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    match collector.run().await {
        Ok(summary) => {
            println!();
            println!("Scan complete in {:.2}s", summary.elapsed.as_secs_f64());
            println!("  Blocks scanned: {}", summary.blocks_scanned);
            println!("  Blocks skipped: {} (already cached)", summary.blocks_skipped);
            println!("  Listings stored: {}", summary.hits_stored);
            Ok(())
        }
        Err(scan::ScanError::RateLimited) => {
            tracing::error!(
                "CRITICAL: API rate limit hit. Stop and check your account \
                 limits before re-running."
            );
            Err(scan::ScanError::RateLimited.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_limits(cfg: &config::Config) -> Result<()> {
    let client = authenticate(cfg).await?;
    let limits_report = client.check_limits().await?;
    println!("{}", limits_report);
    Ok(())
}

async fn cmd_report(cfg: &config::Config, history: bool) -> Result<()> {
    let store = store::Store::open(&cfg.db_path)?;
    let table = if history {
        store::HitTable::History
    } else {
        store::HitTable::Live
    };
    let rendered = report::summary_report(&store, table).await?;
    println!("{}", rendered);
    Ok(())
}

fn cmd_config(cfg: &config::Config) -> Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file:   {}", config::get_config_file_path_string());
    println!("API endpoint:  {} (from {})", cfg.api_url, cfg.source);
    println!("Dataset/mode:  {}/{}", cfg.dataset, cfg.mode);
    println!("Concurrency:   {}", cfg.concurrency);
    println!("Database:      {}", cfg.db_path.display());
    println!("Token file:    {}", cfg.token_path.display());
    println!("Target list:   {}", cfg.target_file.display());
    println!();
    println!("Environment variables:");
    println!("  SIASCOUT_USERNAME / SIASCOUT_PASSWORD - API credentials");
    println!("  SIASCOUT_API_URL - Override API endpoint");
    println!();
    println!("Example config.toml:");
    println!();
    println!("{}", config::generate_example_config());
    Ok(())
}
