//! Storage traits and error types
//!
//! This module defines the trait interface for progress store backends and
//! associated error types.

use crate::state::{ItemStatus, JobStatus};
use crate::storage::{
    CrawlJobRecord, DiscoveredListing, ItemKey, ItemOutcome, ItemRecord, ItemScope, JobSummary,
    ListingOutcome, PageRecord,
};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Crawl job not found: {0}")]
    JobNotFound(i64),

    #[error("Listing page not found: {0}")]
    PageNotFound(i64),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable three-level crawl progress (job, listing page, item)
///
/// Every mutation is either an idempotent upsert keyed by a natural key or a
/// single transaction, so a crash at any point leaves the store consistent and
/// a resumed run never double-counts.
pub trait ProgressStore {
    // ===== Job Management =====

    /// Creates the job for a task type, or returns the existing one
    ///
    /// # Arguments
    ///
    /// * `task_type` - Natural key of the job, e.g. "genre_listing"
    /// * `config_hash` - Hash of the configuration driving this run
    fn upsert_job(&mut self, task_type: &str, config_hash: &str) -> StorageResult<CrawlJobRecord>;

    fn get_job(&self, job_id: i64) -> StorageResult<CrawlJobRecord>;

    fn get_job_by_task_type(&self, task_type: &str) -> StorageResult<Option<CrawlJobRecord>>;

    fn list_jobs(&self) -> StorageResult<Vec<CrawlJobRecord>>;

    /// Jobs a scheduler should walk (pending or running)
    fn active_jobs(&self) -> StorageResult<Vec<CrawlJobRecord>>;

    /// Moves a job forward
    ///
    /// Returns `InvalidTransition` for any backward move; reopening goes
    /// through [`ProgressStore::reopen_job`].
    fn update_job_status(
        &mut self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> StorageResult<()>;

    /// Moves a completed or failed job back to running
    ///
    /// Returns false when the job was not terminal.
    fn reopen_job(&mut self, job_id: i64) -> StorageResult<bool>;

    /// Settles a job from the state of its pages
    ///
    /// The job is completed once every page is terminal, failed if no page was
    /// ever discovered, and left running otherwise.
    fn finalize_job(&mut self, job_id: i64) -> StorageResult<JobStatus>;

    /// Deletes every page and item of a job and puts it back to pending
    ///
    /// # Returns
    ///
    /// Number of deleted rows
    fn reset_job(&mut self, job_id: i64) -> StorageResult<usize>;

    /// Marks every listing page of a job for another listing fetch
    ///
    /// Items and their outcomes are kept; re-recorded listings only add items
    /// that were not seen before. A terminal job is reopened.
    ///
    /// # Returns
    ///
    /// Number of pages queued for rediscovery
    fn rediscover_job(&mut self, job_id: i64) -> StorageResult<usize>;

    // ===== Page Management =====

    /// Creates a listing page row, or returns the existing one
    fn upsert_page(
        &mut self,
        job_id: i64,
        relation_id: i64,
        page_number: u32,
    ) -> StorageResult<PageRecord>;

    fn get_page(&self, page_id: i64) -> StorageResult<PageRecord>;

    fn pages_for_job(&self, job_id: i64) -> StorageResult<Vec<PageRecord>>;

    /// Discovered pages whose items are not all terminal yet
    fn open_pages(&self, job_id: i64) -> StorageResult<Vec<PageRecord>>;

    /// Claims listing pages that still need their listing fetched
    ///
    /// Pending pages and stale running pages are returned, at most `limit`,
    /// and marked running in the same transaction.
    fn claim_pending_pages(&mut self, job_id: i64, limit: usize)
        -> StorageResult<Vec<PageRecord>>;

    /// Records the items and page count revealed by a listing page
    ///
    /// # Arguments
    ///
    /// * `page_id` - The listing page that was fetched
    /// * `listing` - Parsed items and optional page count
    /// * `max_pages` - Optional cap on pages created for the relation
    fn record_listing(
        &mut self,
        page_id: i64,
        listing: &DiscoveredListing,
        max_pages: Option<u32>,
    ) -> StorageResult<ListingOutcome>;

    /// Counts a failed listing attempt while the page stays claimed
    fn record_page_attempt_failure(&mut self, page_id: i64, error: &str) -> StorageResult<()>;

    /// Gives up on a listing page
    fn mark_page_failed(&mut self, page_id: i64, error: &str, attempted: bool)
        -> StorageResult<()>;

    /// Returns a claimed, undiscovered page to the pending pool
    fn release_page(&mut self, page_id: i64) -> StorageResult<()>;

    // ===== Item Management =====

    fn get_item(&self, key: &ItemKey) -> StorageResult<Option<ItemRecord>>;

    fn items_for_page(&self, page_id: i64) -> StorageResult<Vec<ItemRecord>>;

    /// Claims items for detail fetching
    ///
    /// Returns up to `limit` items that are pending, failed with attempts
    /// left, or running past the staleness threshold, and marks them running
    /// in the same transaction. Two claims never return the same item.
    fn claim_pending_items(&mut self, scope: ItemScope, limit: usize)
        -> StorageResult<Vec<ItemRecord>>;

    /// Counts a failed attempt while the item stays claimed
    fn record_item_attempt_failure(&mut self, key: &ItemKey, error: &str) -> StorageResult<()>;

    /// Records a terminal outcome for an item
    ///
    /// Updates the item and its page counter in one transaction. Calling it
    /// again for an item that is already terminal changes nothing.
    ///
    /// # Returns
    ///
    /// True if the outcome was applied, false if the item was already terminal
    fn mark_item_result(&mut self, key: &ItemKey, outcome: &ItemOutcome) -> StorageResult<bool>;

    /// Returns a claimed item to the claimable pool without a verdict
    fn release_item(&mut self, key: &ItemKey) -> StorageResult<()>;

    /// Operator requeue of one item: status pending, retries and error cleared
    ///
    /// # Returns
    ///
    /// True if the item was failed and is pending again; false for items that
    /// are pending, running or successful, which are left untouched
    fn requeue_item(&mut self, key: &ItemKey) -> StorageResult<bool>;

    /// Operator requeue of every failed item and failed listing page of a job
    ///
    /// # Returns
    ///
    /// Number of requeued rows
    fn requeue_failed(&mut self, job_id: i64) -> StorageResult<usize>;

    // ===== Statistics =====

    fn count_items_by_status(&self, job_id: i64) -> StorageResult<HashMap<ItemStatus, u64>>;

    fn job_summary(&self, job_id: i64) -> StorageResult<JobSummary>;
}
