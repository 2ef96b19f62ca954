//! reelcrawl main entry point
//!
//! This is the command-line interface for the resumable catalogue crawler.

use anyhow::{bail, Context};
use clap::Parser;
use reelcrawl::config::{load_config_with_hash, Config};
use reelcrawl::crawler::{run_crawl, RunOptions, StopFlag};
use reelcrawl::output::{load_statistics, print_run_summary, print_statistics};
use reelcrawl::storage::{open_store, ClaimPolicy, ProgressStore};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// reelcrawl: a resumable crawler for authentication-gated video catalogues
///
/// reelcrawl logs in, walks listing pages and fetches item detail pages,
/// persisting progress so an interrupted crawl resumes where it stopped.
#[derive(Parser, Debug)]
#[command(name = "reelcrawl")]
#[command(version)]
#[command(about = "A resumable catalogue crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be crawled without crawling
    #[arg(long, conflicts_with_all = ["stats", "requeue_failed", "reset"])]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "requeue_failed", "reset"])]
    stats: bool,

    /// Requeue every failed item and listing page, then exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats", "reset"])]
    requeue_failed: bool,

    /// Delete all progress of one job so it is crawled from scratch, then exit
    #[arg(long, value_name = "TASK_TYPE", conflicts_with_all = ["dry_run", "stats", "requeue_failed"])]
    reset: Option<String>,

    /// Fetch listing pages of finished jobs again to pick up new items
    #[arg(long)]
    rediscover: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else if cli.requeue_failed {
        handle_requeue_failed(&config)?;
    } else if let Some(task_type) = &cli.reset {
        handle_reset(&config, task_type)?;
    } else {
        let options = RunOptions {
            rediscover: cli.rediscover,
        };
        handle_crawl(&config, &config_hash, options).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("reelcrawl=info,warn"),
            1 => EnvFilter::new("reelcrawl=debug,info"),
            2 => EnvFilter::new("reelcrawl=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn open_progress_store(config: &Config) -> anyhow::Result<reelcrawl::SqliteProgressStore> {
    open_store(
        Path::new(&config.output.database_path),
        ClaimPolicy::from_config(config),
    )
    .with_context(|| format!("failed to open {}", config.output.database_path))
}

/// Handles the --dry-run mode: validates config and shows what would be crawled
fn handle_dry_run(config: &Config) {
    println!("=== reelcrawl Dry Run ===\n");

    println!("Site:");
    println!("  Base URL: {}", config.site.base_url);
    println!("  User agent: {}", config.site.user_agent);

    println!("\nAuthentication:");
    if config.auth.manual_session.is_some() {
        println!("  Manual session (automatic login disabled)");
    } else {
        println!(
            "  Login as {}",
            config.auth.username.as_deref().unwrap_or("<unset>")
        );
        println!("  Session TTL: {}s", config.auth.session_ttl_secs);
    }

    println!("\nRetry:");
    println!("  Max attempts: {}", config.retry.max_attempts);
    println!(
        "  Backoff: {}ms base, {}ms cap, ±{}% jitter",
        config.retry.backoff_base_ms, config.retry.backoff_cap_ms, config.retry.jitter_percent
    );

    println!("\nScheduler:");
    println!("  Batch size: {}", config.scheduler.batch_size);
    println!(
        "  Browser pool: {:?} x{}",
        config.browser.mode, config.browser.pool_size
    );

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);
    println!("  Items: {}", config.output.items_path);

    println!("\nCatalogue ({}):", config.catalogue.len());
    for entry in &config.catalogue {
        println!(
            "  - {} ({} relations, listing {}, detail {})",
            entry.task_type,
            entry.relations.len(),
            entry.listing_mode,
            entry.detail_mode
        );
        println!("    * {}", entry.listing_url);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.output.database_path);

    let store = open_progress_store(config)?;
    let stats = load_statistics(&store)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --requeue-failed mode
fn handle_requeue_failed(config: &Config) -> anyhow::Result<()> {
    let mut store = open_progress_store(config)?;

    for job in store.list_jobs()? {
        let requeued = store.requeue_failed(job.id)?;
        println!("{}: {} units requeued", job.task_type, requeued);
    }

    Ok(())
}

/// Handles the --reset mode
fn handle_reset(config: &Config, task_type: &str) -> anyhow::Result<()> {
    if config.catalogue_for(task_type).is_none() {
        bail!("no catalogue configured for task type '{}'", task_type);
    }

    let mut store = open_progress_store(config)?;
    match store.get_job_by_task_type(task_type)? {
        Some(job) => {
            let deleted = store.reset_job(job.id)?;
            println!("{}: {} rows deleted, job reset", task_type, deleted);
        }
        None => println!("{}: nothing to reset", task_type),
    }

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: &Config, config_hash: &str, options: RunOptions) -> anyhow::Result<()> {
    tracing::info!(
        "Starting crawl of {} catalogue entries (resumes any unfinished work)",
        config.catalogue.len()
    );

    let stop = StopFlag::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; finishing in-flight work");
                stop.stop();
            }
        });
    }

    match run_crawl(config, config_hash, options, stop).await {
        Ok(summary) => {
            print_run_summary(&summary);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}
