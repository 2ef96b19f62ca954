//! Crawler module for catalogue traversal
//!
//! This module contains the core crawling logic, including:
//! - The per-unit retry loop shared by listing pages and items
//! - Listing parsing and item persistence seams
//! - Overall crawl scheduling across jobs, pages and items

mod dispatch;
mod listing;
mod scheduler;

pub use dispatch::{SharedStore, StopFlag};
pub use listing::{expand_listing_url, ItemSink, JsonListingParser, ListingParser, ParseError};
pub use scheduler::{CrawlScheduler, RunOptions, RunSummary};

use crate::auth::CredentialBroker;
use crate::config::Config;
use crate::fetch::{build_http_client, FetchMode, HttpFetcher, SessionFetcher};
use crate::output::JsonlItemSink;
use crate::retry::RetryPolicy;
use crate::storage::{open_store, ClaimPolicy};
use crate::CrawlError;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Runs a complete crawl with the built-in collaborators
///
/// This is the main entry point for the binary. It will:
/// 1. Open the progress store
/// 2. Build the HTTP client and the credential broker
/// 3. Open the JSON Lines item sink
/// 4. Run the scheduler until the work is done or `stop` is set
///
/// Rendered fetches need a browser launcher, which only an embedding
/// application can supply; without one they fail as unsupported.
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `config_hash` - Hash of the configuration file
/// * `options` - Run-level switches
/// * `stop` - Stop flag, typically set from a Ctrl-C handler
///
/// # Returns
///
/// * `Ok(RunSummary)` - Per-job progress after the run
/// * `Err(CrawlError)` - Crawl failed
pub async fn run_crawl(
    config: &Config,
    config_hash: &str,
    options: RunOptions,
    stop: StopFlag,
) -> Result<RunSummary, CrawlError> {
    let store = open_store(
        Path::new(&config.output.database_path),
        ClaimPolicy::from_config(config),
    )?;

    let client = build_http_client(&config.site)?;
    let broker = CredentialBroker::from_config(
        client.clone(),
        &config.site,
        &config.auth,
        RetryPolicy::new(&config.retry),
        Vec::new(),
    )?;

    let rendered = config.catalogue.iter().any(|entry| {
        entry.listing_mode == FetchMode::Rendered || entry.detail_mode == FetchMode::Rendered
    });
    if rendered {
        tracing::warn!(
            "Catalogue requests rendered fetches but no browser launcher is available; \
             those units will fail as unsupported"
        );
    }

    let fetcher = Arc::new(SessionFetcher::new(HttpFetcher::new(client)));
    let sink = JsonlItemSink::open(Path::new(&config.output.items_path))?;

    let scheduler = CrawlScheduler::new(
        config,
        config_hash,
        Arc::new(Mutex::new(store)),
        Arc::new(broker),
        fetcher.clone(),
        Arc::new(sink),
    )
    .with_options(options)
    .with_stop_flag(stop);

    let summary = scheduler.run().await;
    fetcher.shutdown().await;
    summary
}
