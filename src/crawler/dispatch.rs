//! Per-unit retry loop and batch dispatch
//!
//! Listing pages and items go through the same loop: get a session, fetch,
//! interpret, and on failure let the retry policy decide between backing off,
//! refreshing the session and giving up. Every decision is written to the
//! progress store before the loop moves on.

use crate::auth::{AuthError, CredentialBroker};
use crate::crawler::listing::{ItemSink, ListingParser};
use crate::fetch::{FetchClient, FetchError, FetchMode, FetchResult};
use crate::retry::{AttemptHistory, RetryDecision, RetryPolicy};
use crate::storage::{
    DiscoveredListing, ItemOutcome, ItemRecord, PageRecord, ProgressStore, SqliteProgressStore,
    StorageResult,
};
use crate::CrawlError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

/// Progress store shared by the scheduler and its tasks
pub type SharedStore = Arc<Mutex<SqliteProgressStore>>;

/// Runs `op` against the shared store
///
/// The guard is dropped before returning, so callers never hold it across an
/// `.await`.
pub(crate) fn with_store<T>(
    store: &SharedStore,
    op: impl FnOnce(&mut SqliteProgressStore) -> StorageResult<T>,
) -> Result<T, CrawlError> {
    let mut guard = store.lock().map_err(|_| CrawlError::LockPoisoned)?;
    Ok(op(&mut guard)?)
}

/// Cooperative cancellation shared by a run and its tasks
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks every loop to wind down at its next check
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`StopFlag::stop`] has been called
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// What the retry loop needs to run any unit
pub(crate) struct UnitContext {
    pub store: SharedStore,
    pub broker: Arc<CredentialBroker>,
    pub fetcher: Arc<dyn FetchClient>,
    pub retry: RetryPolicy,
    pub stop: StopFlag,
    pub permits: Arc<Semaphore>,
}

/// How a unit left the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitOutcome {
    Succeeded,
    Failed,
    /// Handed back unfinished because the run is stopping
    Released,
}

/// Tally of one dispatched batch
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BatchTally {
    pub succeeded: usize,
    pub failed: usize,
    pub released: usize,
}

impl BatchTally {
    fn add(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Succeeded => self.succeeded += 1,
            UnitOutcome::Failed => self.failed += 1,
            UnitOutcome::Released => self.released += 1,
        }
    }

    pub fn merge(&mut self, other: BatchTally) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.released += other.released;
    }
}

/// A claimed unit of work and the store calls recording its fate
pub(crate) trait WorkUnit: Send + Sync + 'static {
    type Output: Send;

    /// Human-readable identity for logs
    fn label(&self) -> String;
    fn url(&self) -> &str;
    fn mode(&self) -> FetchMode;
    /// Attempts already spent in earlier runs
    fn retries_used(&self) -> u32;
    fn last_error(&self) -> Option<&str>;

    /// Turns a fetched payload into the unit's result
    fn interpret(&self, fetched: FetchResult) -> Result<Self::Output, FetchError>;

    fn record_success(&self, store: &mut SqliteProgressStore, output: Self::Output)
        -> StorageResult<()>;
    fn record_attempt_failure(&self, store: &mut SqliteProgressStore, error: &str)
        -> StorageResult<()>;
    fn record_terminal(
        &self,
        store: &mut SqliteProgressStore,
        error: &str,
        attempted: bool,
    ) -> StorageResult<()>;
    fn release(&self, store: &mut SqliteProgressStore) -> StorageResult<()>;
}

/// Drives one unit to success, a terminal failure or a release
///
/// # Returns
///
/// * `Ok(UnitOutcome)` - What happened to the unit
/// * `Err(CrawlError)` - A storage or authentication failure that ends the run
pub(crate) async fn run_unit<U: WorkUnit>(
    ctx: &UnitContext,
    unit: &U,
) -> Result<UnitOutcome, CrawlError> {
    let mut history = AttemptHistory::from_last_error(unit.last_error());
    let mut attempts_used = unit.retries_used();

    loop {
        if ctx.stop.is_stopped() {
            with_store(&ctx.store, |s| unit.release(s))?;
            return Ok(UnitOutcome::Released);
        }

        let session = match ctx.broker.get_session(false).await {
            Ok(session) => session,
            Err(e) => {
                with_store(&ctx.store, |s| unit.release(s))?;
                return Err(e.into());
            }
        };
        let result = match ctx.fetcher.fetch(unit.url(), unit.mode(), &session).await {
            Ok(fetched) => unit.interpret(fetched),
            Err(e) => Err(e),
        };

        let err = match result {
            Ok(output) => {
                with_store(&ctx.store, |s| unit.record_success(s, output))?;
                tracing::debug!("Fetched {}", unit.label());
                return Ok(UnitOutcome::Succeeded);
            }
            Err(err) => err,
        };

        attempts_used += 1;
        let tagged = err.tagged();

        let session_rejected = matches!(err, FetchError::SessionExpired { .. });
        if session_rejected && ctx.broker.is_manual() {
            let error = format!("{}: {}", err.kind(), AuthError::ManualSessionExpired);
            tracing::warn!("{} failed: {}", unit.label(), error);
            with_store(&ctx.store, |s| unit.record_terminal(s, &error, true))?;
            return Ok(UnitOutcome::Failed);
        }

        match ctx.retry.decide(&err, attempts_used, &mut history) {
            RetryDecision::GiveUp => {
                tracing::warn!(
                    "Giving up on {} after {} attempts: {}",
                    unit.label(),
                    attempts_used,
                    tagged
                );
                with_store(&ctx.store, |s| unit.record_terminal(s, &tagged, true))?;
                // Other units must not keep using the rejected session
                if session_rejected {
                    ctx.broker.invalidate_if_current(&session).await?;
                }
                return Ok(UnitOutcome::Failed);
            }
            RetryDecision::RefreshSession => {
                match ctx.broker.invalidate_if_current(&session).await {
                    Ok(_) => {
                        tracing::info!("Session rejected on {}; refreshing", unit.label());
                        with_store(&ctx.store, |s| unit.record_attempt_failure(s, &tagged))?;
                    }
                    Err(e) => {
                        with_store(&ctx.store, |s| unit.record_attempt_failure(s, &tagged))?;
                        with_store(&ctx.store, |s| unit.release(s))?;
                        return Err(e.into());
                    }
                }
            }
            RetryDecision::RetryAfter(delay) => {
                tracing::debug!(
                    "Attempt {} of {} failed ({}); retrying in {:?}",
                    attempts_used,
                    unit.label(),
                    tagged,
                    delay
                );
                with_store(&ctx.store, |s| unit.record_attempt_failure(s, &tagged))?;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.stop.stopped() => {}
                }
            }
        }
    }
}

/// Runs a batch of units concurrently, bounded by the context's permits
///
/// A fatal error stops the run; the remaining tasks release their units and
/// the first fatal error is returned.
pub(crate) async fn dispatch_batch<U: WorkUnit>(
    ctx: &Arc<UnitContext>,
    units: Vec<U>,
) -> Result<BatchTally, CrawlError> {
    let mut tasks = JoinSet::new();

    for unit in units {
        let permit = Arc::clone(&ctx.permits)
            .acquire_owned()
            .await
            .map_err(|_| CrawlError::Pool("dispatch permits closed".to_string()))?;
        let ctx = Arc::clone(ctx);
        tasks.spawn(async move {
            let _permit = permit;
            run_unit(&ctx, &unit).await
        });
    }

    let mut tally = BatchTally::default();
    let mut fatal = None;
    while let Some(joined) = tasks.join_next().await {
        match joined? {
            Ok(outcome) => tally.add(outcome),
            Err(e) => {
                if fatal.is_none() {
                    tracing::error!("Stopping run: {}", e);
                    ctx.stop.stop();
                    fatal = Some(e);
                }
            }
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(tally),
    }
}

/// A claimed listing page
pub(crate) struct PageWork {
    pub page: PageRecord,
    pub url: String,
    pub mode: FetchMode,
    pub max_pages: Option<u32>,
    pub parser: Arc<dyn ListingParser>,
}

impl WorkUnit for PageWork {
    type Output = DiscoveredListing;

    fn label(&self) -> String {
        format!(
            "listing page {} of relation {}",
            self.page.page_number, self.page.relation_id
        )
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn mode(&self) -> FetchMode {
        self.mode
    }

    fn retries_used(&self) -> u32 {
        self.page.retry_count
    }

    fn last_error(&self) -> Option<&str> {
        self.page.last_error.as_deref()
    }

    fn interpret(&self, fetched: FetchResult) -> Result<DiscoveredListing, FetchError> {
        self.parser
            .parse_listing(&fetched.body, &fetched.final_url)
            .map_err(|e| e.into_fetch_error(&fetched.final_url))
    }

    fn record_success(
        &self,
        store: &mut SqliteProgressStore,
        listing: DiscoveredListing,
    ) -> StorageResult<()> {
        let outcome = store.record_listing(self.page.id, &listing, self.max_pages)?;
        tracing::info!(
            "Discovered {} new items on {} ({} pages added)",
            outcome.new_items,
            self.label(),
            outcome.pages_created
        );
        Ok(())
    }

    fn record_attempt_failure(
        &self,
        store: &mut SqliteProgressStore,
        error: &str,
    ) -> StorageResult<()> {
        store.record_page_attempt_failure(self.page.id, error)
    }

    fn record_terminal(
        &self,
        store: &mut SqliteProgressStore,
        error: &str,
        attempted: bool,
    ) -> StorageResult<()> {
        store.mark_page_failed(self.page.id, error, attempted)
    }

    fn release(&self, store: &mut SqliteProgressStore) -> StorageResult<()> {
        store.release_page(self.page.id)
    }
}

/// A claimed item awaiting its detail fetch
pub(crate) struct ItemWork {
    pub item: ItemRecord,
    pub mode: FetchMode,
    pub sink: Arc<dyn ItemSink>,
}

impl WorkUnit for ItemWork {
    type Output = ();

    fn label(&self) -> String {
        format!("item {}", self.item.key())
    }

    fn url(&self) -> &str {
        &self.item.url
    }

    fn mode(&self) -> FetchMode {
        self.mode
    }

    fn retries_used(&self) -> u32 {
        self.item.retry_count
    }

    fn last_error(&self) -> Option<&str> {
        self.item.last_error.as_deref()
    }

    fn interpret(&self, fetched: FetchResult) -> Result<(), FetchError> {
        self.sink
            .accept(&self.item, &fetched)
            .map_err(|e| e.into_fetch_error(&fetched.final_url))
    }

    fn record_success(&self, store: &mut SqliteProgressStore, _: ()) -> StorageResult<()> {
        store.mark_item_result(&self.item.key(), &ItemOutcome::Success)?;
        Ok(())
    }

    fn record_attempt_failure(
        &self,
        store: &mut SqliteProgressStore,
        error: &str,
    ) -> StorageResult<()> {
        store.record_item_attempt_failure(&self.item.key(), error)
    }

    fn record_terminal(
        &self,
        store: &mut SqliteProgressStore,
        error: &str,
        attempted: bool,
    ) -> StorageResult<()> {
        store.mark_item_result(
            &self.item.key(),
            &ItemOutcome::Failed {
                error: error.to_string(),
                attempted,
            },
        )?;
        Ok(())
    }

    fn release(&self, store: &mut SqliteProgressStore) -> StorageResult<()> {
        store.release_item(&self.item.key())
    }
}
