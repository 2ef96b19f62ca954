//! Storage module for persisting crawl progress
//!
//! This module handles all database operations for the crawler, including:
//! - SQLite database initialization and schema management
//! - Crawl job, listing page and item progress rows
//! - Atomic claiming of pending work with stale-claim recovery
//! - Transactional result recording that keeps page counters exact

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteProgressStore;
pub use traits::{ProgressStore, StorageError, StorageResult};

use crate::config::Config;
use crate::state::{ItemStatus, JobStatus, PageStatus};
use crate::CrawlError;

use std::path::Path;
use std::time::Duration;

/// Opens (or creates) a progress database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
/// * `policy` - Claim policy applied to every claim made through this handle
///
/// # Returns
///
/// * `Ok(SqliteProgressStore)` - Successfully initialized storage
/// * `Err(CrawlError)` - Failed to initialize storage
pub fn open_store(path: &Path, policy: ClaimPolicy) -> Result<SqliteProgressStore, CrawlError> {
    SqliteProgressStore::new(path, policy)
}

/// Rules deciding which units a claim may hand out
#[derive(Debug, Clone, Copy)]
pub struct ClaimPolicy {
    /// A running unit older than this is treated as abandoned
    pub stale_after: Duration,

    /// Units that already failed this many times are no longer claimable
    pub max_attempts: u32,
}

impl ClaimPolicy {
    /// Derives the policy from the scheduler and retry settings
    pub fn from_config(config: &Config) -> Self {
        Self {
            stale_after: Duration::from_secs(config.scheduler.stale_after_secs),
            max_attempts: config.retry.max_attempts,
        }
    }
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(600),
            max_attempts: 3,
        }
    }
}

/// Represents a crawl job in the database
#[derive(Debug, Clone)]
pub struct CrawlJobRecord {
    pub id: i64,
    pub task_type: String,
    pub status: JobStatus,
    pub config_hash: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Represents one listing page of a crawl job
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub id: i64,
    pub crawl_job_id: i64,
    pub relation_id: i64,
    pub page_number: u32,
    pub total_pages: u32,
    pub total_items: u32,
    pub processed_items: u32,
    pub status: PageStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Set once the listing was fetched and its items recorded
    pub discovered_at: Option<String>,
    pub updated_at: String,
}

/// Represents one item awaiting (or done with) its detail fetch
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub id: i64,
    pub code: String,
    pub genre_id: i64,
    /// Listing page whose counter this item drives
    pub page_unit_id: Option<i64>,
    pub url: String,
    pub page_number: u32,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub detail_fetched: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ItemRecord {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.code, self.genre_id)
    }
}

/// Natural key of an item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub code: String,
    pub genre_id: i64,
}

impl ItemKey {
    pub fn new(code: &str, genre_id: i64) -> Self {
        Self {
            code: code.to_string(),
            genre_id,
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.code, self.genre_id)
    }
}

/// Which items a claim may return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemScope {
    /// Items owned by one listing page
    Page(i64),
    /// Items owned by any page of a job
    Job(i64),
}

/// An item reference read off a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    pub code: String,
    pub url: String,
}

/// Everything a listing page revealed
#[derive(Debug, Clone, Default)]
pub struct DiscoveredListing {
    /// Page count of the relation, when the page reports it
    pub total_pages: Option<u32>,
    pub items: Vec<ItemRef>,
}

/// Result of recording a listing page
#[derive(Debug, Clone)]
pub struct ListingOutcome {
    /// Items inserted by this call (already-known items are not counted)
    pub new_items: usize,
    /// Items now owned by the page
    pub total_items: u32,
    /// Pages newly created from the reported page count
    pub pages_created: usize,
    pub page_status: PageStatus,
}

/// Terminal outcome of an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Detail fetched and accepted by the sink
    Success,

    /// Item gave up; `attempted` counts the failure toward `retry_count`
    Failed { error: String, attempted: bool },
}

impl ItemOutcome {
    pub fn status(&self) -> ItemStatus {
        match self {
            Self::Success => ItemStatus::Success,
            Self::Failed { .. } => ItemStatus::FailedTerminal,
        }
    }
}

/// Progress counts for one crawl job
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job: CrawlJobRecord,
    pub pages_total: u64,
    pub pages_completed: u64,
    pub pages_failed: u64,
    pub items_success: u64,
    pub items_failed_terminal: u64,
    /// Items not yet terminal (pending, running or retryable)
    pub items_pending: u64,
}

impl JobSummary {
    pub fn items_total(&self) -> u64 {
        self.items_success + self.items_failed_terminal + self.items_pending
    }
}
