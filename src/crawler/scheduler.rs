//! Crawl scheduler - main crawl orchestration logic
//!
//! This module contains the loop that walks every configured catalogue:
//! - Ensuring a crawl job per catalogue entry
//! - Seeding and discovering listing pages
//! - Claiming and dispatching item detail fetches
//! - Settling jobs once all of their pages are terminal

use crate::auth::CredentialBroker;
use crate::config::{CatalogueEntry, Config};
use crate::crawler::dispatch::{
    dispatch_batch, with_store, BatchTally, ItemWork, PageWork, SharedStore, StopFlag,
    UnitContext,
};
use crate::crawler::listing::{ItemSink, JsonListingParser, ListingParser};
use crate::fetch::FetchClient;
use crate::retry::RetryPolicy;
use crate::state::JobStatus;
use crate::storage::{ItemScope, JobSummary, ProgressStore};
use crate::CrawlError;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Run-level switches set from the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Reopen finished jobs and fetch their listing pages again
    pub rediscover: bool,
}

/// Outcome of one scheduler run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub jobs: Vec<JobSummary>,
    /// The run ended because of a stop request
    pub interrupted: bool,
    /// Logins performed during the run
    pub logins: u64,
}

impl RunSummary {
    pub fn items_success(&self) -> u64 {
        self.jobs.iter().map(|j| j.items_success).sum()
    }

    pub fn items_failed_terminal(&self) -> u64 {
        self.jobs.iter().map(|j| j.items_failed_terminal).sum()
    }

    pub fn items_pending(&self) -> u64 {
        self.jobs.iter().map(|j| j.items_pending).sum()
    }

    /// Summary of the job with the given task type
    pub fn job(&self, task_type: &str) -> Option<&JobSummary> {
        self.jobs.iter().find(|j| j.job.task_type == task_type)
    }
}

/// Main scheduler structure
pub struct CrawlScheduler {
    catalogue: Vec<CatalogueEntry>,
    config_hash: String,
    batch_size: usize,
    options: RunOptions,
    ctx: Arc<UnitContext>,
    parser: Arc<dyn ListingParser>,
    sink: Arc<dyn ItemSink>,
}

impl CrawlScheduler {
    /// Creates a new scheduler
    ///
    /// Concurrency defaults to the configured pool size and listing pages are
    /// read with [`JsonListingParser`].
    ///
    /// # Arguments
    ///
    /// * `config` - The crawler configuration
    /// * `config_hash` - Hash of the configuration file, stored on each job
    /// * `store` - Shared progress store
    /// * `broker` - Session source for every fetch
    /// * `fetcher` - Fetch client for listing and detail pages
    /// * `sink` - Receives every fetched item
    pub fn new(
        config: &Config,
        config_hash: &str,
        store: SharedStore,
        broker: Arc<CredentialBroker>,
        fetcher: Arc<dyn FetchClient>,
        sink: Arc<dyn ItemSink>,
    ) -> Self {
        let ctx = UnitContext {
            store,
            broker,
            fetcher,
            retry: RetryPolicy::new(&config.retry),
            stop: StopFlag::new(),
            permits: Arc::new(Semaphore::new(config.browser.pool_size.max(1) as usize)),
        };

        Self {
            catalogue: config.catalogue.clone(),
            config_hash: config_hash.to_string(),
            batch_size: config.scheduler.batch_size.max(1) as usize,
            options: RunOptions::default(),
            ctx: Arc::new(ctx),
            parser: Arc::new(JsonListingParser),
            sink,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn ListingParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Caps the number of units fetched at once
    pub fn with_concurrency(self, concurrency: usize) -> Self {
        self.map_context(|ctx| ctx.permits = Arc::new(Semaphore::new(concurrency.max(1))))
    }

    /// Shares a stop flag with the caller
    pub fn with_stop_flag(self, stop: StopFlag) -> Self {
        self.map_context(|ctx| ctx.stop = stop)
    }

    fn map_context(mut self, update: impl FnOnce(&mut UnitContext)) -> Self {
        // Builders run before any task holds a clone of the context
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            update(ctx);
        }
        self
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.ctx.stop.clone()
    }

    /// Runs every configured catalogue until its work is done or the run stops
    ///
    /// # Returns
    ///
    /// * `Ok(RunSummary)` - Per-job progress, also when the run was interrupted
    /// * `Err(CrawlError)` - A storage or authentication failure ended the run
    pub async fn run(&self) -> Result<RunSummary, CrawlError> {
        let mut job_ids = Vec::with_capacity(self.catalogue.len());

        for entry in &self.catalogue {
            let job = with_store(&self.ctx.store, |s| {
                s.upsert_job(&entry.task_type, &self.config_hash)
            })?;

            if self.options.rediscover {
                let pages = with_store(&self.ctx.store, |s| s.rediscover_job(job.id))?;
                if pages > 0 {
                    tracing::info!(
                        "Rediscovering {} listing pages of '{}'",
                        pages,
                        entry.task_type
                    );
                }
            }

            job_ids.push((entry, job.id));
        }

        for (entry, job_id) in &job_ids {
            if self.ctx.stop.is_stopped() {
                break;
            }

            let job = with_store(&self.ctx.store, |s| s.get_job(*job_id))?;
            if !job.status.is_active() {
                tracing::info!("Job '{}' is {}; skipping", job.task_type, job.status);
                continue;
            }

            self.run_job(entry, *job_id).await?;
        }

        let mut jobs = Vec::with_capacity(job_ids.len());
        for (_, job_id) in &job_ids {
            let summary = with_store(&self.ctx.store, |s| s.job_summary(*job_id))?;
            tracing::info!(
                "Job '{}' {}: {} succeeded, {} failed, {} pending ({} / {} pages done)",
                summary.job.task_type,
                summary.job.status,
                summary.items_success,
                summary.items_failed_terminal,
                summary.items_pending,
                summary.pages_completed + summary.pages_failed,
                summary.pages_total
            );
            jobs.push(summary);
        }

        Ok(RunSummary {
            jobs,
            interrupted: self.ctx.stop.is_stopped(),
            logins: self.ctx.broker.login_count(),
        })
    }

    /// Walks one job: seed, discover, fetch items, settle
    async fn run_job(&self, entry: &CatalogueEntry, job_id: i64) -> Result<(), CrawlError> {
        tracing::info!("Starting job '{}'", entry.task_type);

        with_store(&self.ctx.store, |s| {
            s.update_job_status(job_id, JobStatus::Running, None)?;
            for relation_id in &entry.relations {
                s.upsert_page(job_id, *relation_id, 1)?;
            }
            Ok(())
        })?;

        let pages = self.discover(entry, job_id).await?;
        tracing::info!(
            "Discovery of '{}': {} listing pages fetched, {} failed",
            entry.task_type,
            pages.succeeded,
            pages.failed
        );

        let items = self.fetch_items(entry, job_id).await?;
        tracing::info!(
            "Items of '{}': {} succeeded, {} failed",
            entry.task_type,
            items.succeeded,
            items.failed
        );

        if self.ctx.stop.is_stopped() {
            tracing::info!(
                "Job '{}' interrupted; {} units released for the next run",
                entry.task_type,
                pages.released + items.released
            );
            return Ok(());
        }

        let status = with_store(&self.ctx.store, |s| s.finalize_job(job_id))?;
        tracing::info!("Job '{}' is {}", entry.task_type, status);
        Ok(())
    }

    /// Fetches listing pages until none is claimable
    async fn discover(&self, entry: &CatalogueEntry, job_id: i64) -> Result<BatchTally, CrawlError> {
        let mut total = BatchTally::default();

        while !self.ctx.stop.is_stopped() {
            let pages = with_store(&self.ctx.store, |s| {
                s.claim_pending_pages(job_id, self.batch_size)
            })?;
            if pages.is_empty() {
                break;
            }

            let units = pages
                .into_iter()
                .map(|page| PageWork {
                    url: self
                        .parser
                        .listing_url(entry, page.relation_id, page.page_number),
                    page,
                    mode: entry.listing_mode,
                    max_pages: entry.max_pages,
                    parser: Arc::clone(&self.parser),
                })
                .collect();

            total.merge(dispatch_batch(&self.ctx, units).await?);
        }

        Ok(total)
    }

    /// Fetches the items of every open page
    async fn fetch_items(
        &self,
        entry: &CatalogueEntry,
        job_id: i64,
    ) -> Result<BatchTally, CrawlError> {
        let mut total = BatchTally::default();

        loop {
            let open = with_store(&self.ctx.store, |s| s.open_pages(job_id))?;
            let mut progressed = false;

            for page in open {
                loop {
                    if self.ctx.stop.is_stopped() {
                        return Ok(total);
                    }

                    let items = with_store(&self.ctx.store, |s| {
                        s.claim_pending_items(ItemScope::Page(page.id), self.batch_size)
                    })?;
                    if items.is_empty() {
                        break;
                    }
                    progressed = true;

                    let units = items
                        .into_iter()
                        .map(|item| ItemWork {
                            item,
                            mode: entry.detail_mode,
                            sink: Arc::clone(&self.sink),
                        })
                        .collect();

                    total.merge(dispatch_batch(&self.ctx, units).await?);

                    tracing::info!(
                        "Progress: {} items fetched, {} failed",
                        total.succeeded,
                        total.failed
                    );
                }
            }

            // Pages whose items are all claimed elsewhere are left for that claimant
            if !progressed {
                return Ok(total);
            }
        }
    }
}
