//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the ProgressStore trait.
//! Claims and result recording run inside `BEGIN IMMEDIATE` transactions, so
//! two processes sharing one database file still never hand out the same unit.

use crate::state::{ItemStatus, JobStatus, PageStatus};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{ProgressStore, StorageError, StorageResult};
use crate::storage::{
    ClaimPolicy, CrawlJobRecord, DiscoveredListing, ItemKey, ItemOutcome, ItemRecord, ItemScope,
    JobSummary, ListingOutcome, PageRecord,
};
use crate::CrawlError;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const JOB_COLUMNS: &str = "id, task_type, status, config_hash, last_error, created_at, updated_at";

const PAGE_COLUMNS: &str = "id, crawl_job_id, relation_id, page_number, total_pages, total_items, \
     processed_items, status, retry_count, last_error, discovered_at, updated_at";

const ITEM_COLUMNS: &str = "id, code, genre_id, page_unit_id, url, page_number, status, \
     retry_count, last_error, detail_fetched, created_at, updated_at";

/// SQLite progress store
pub struct SqliteProgressStore {
    conn: Connection,
    policy: ClaimPolicy,
}

impl SqliteProgressStore {
    /// Creates a new SqliteProgressStore instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `policy` - Staleness threshold and attempt budget used by claims
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteProgressStore)` - Successfully opened/created database
    /// * `Err(CrawlError)` - Failed to open database
    pub fn new(path: &Path, policy: ClaimPolicy) -> Result<Self, CrawlError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        // A second scheduler on the same file waits for the write lock
        conn.busy_timeout(Duration::from_secs(5))?;

        initialize_schema(&conn)?;

        Ok(Self { conn, policy })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory(policy: ClaimPolicy) -> Result<Self, CrawlError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn, policy })
    }

    /// Returns the claim policy of this handle
    pub fn policy(&self) -> ClaimPolicy {
        self.policy
    }

    /// SQLite date modifier selecting rows older than the staleness threshold
    fn stale_modifier(&self) -> String {
        format!("-{} seconds", self.policy.stale_after.as_secs())
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CrawlJobRecord> {
    Ok(CrawlJobRecord {
        id: row.get(0)?,
        task_type: row.get(1)?,
        status: JobStatus::from_db_string(&row.get::<_, String>(2)?).unwrap_or(JobStatus::Pending),
        config_hash: row.get(3)?,
        last_error: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn page_from_row(row: &Row<'_>) -> rusqlite::Result<PageRecord> {
    Ok(PageRecord {
        id: row.get(0)?,
        crawl_job_id: row.get(1)?,
        relation_id: row.get(2)?,
        page_number: row.get(3)?,
        total_pages: row.get(4)?,
        total_items: row.get(5)?,
        processed_items: row.get(6)?,
        status: PageStatus::from_db_string(&row.get::<_, String>(7)?)
            .unwrap_or(PageStatus::Pending),
        retry_count: row.get(8)?,
        last_error: row.get(9)?,
        discovered_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ItemRecord> {
    Ok(ItemRecord {
        id: row.get(0)?,
        code: row.get(1)?,
        genre_id: row.get(2)?,
        page_unit_id: row.get(3)?,
        url: row.get(4)?,
        page_number: row.get(5)?,
        status: ItemStatus::from_db_string(&row.get::<_, String>(6)?)
            .unwrap_or(ItemStatus::Pending),
        retry_count: row.get(7)?,
        last_error: row.get(8)?,
        detail_fetched: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn load_job(conn: &Connection, job_id: i64) -> StorageResult<CrawlJobRecord> {
    conn.query_row(
        &format!("SELECT {} FROM crawl_jobs WHERE id = ?1", JOB_COLUMNS),
        params![job_id],
        job_from_row,
    )
    .optional()?
    .ok_or(StorageError::JobNotFound(job_id))
}

fn load_page(conn: &Connection, page_id: i64) -> StorageResult<PageRecord> {
    conn.query_row(
        &format!("SELECT {} FROM page_units WHERE id = ?1", PAGE_COLUMNS),
        params![page_id],
        page_from_row,
    )
    .optional()?
    .ok_or(StorageError::PageNotFound(page_id))
}

fn load_item(conn: &Connection, item_id: i64) -> StorageResult<ItemRecord> {
    conn.query_row(
        &format!("SELECT {} FROM item_units WHERE id = ?1", ITEM_COLUMNS),
        params![item_id],
        item_from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::ItemNotFound(format!("id {}", item_id)))
}

/// Re-derives a discovered page's status from the items it owns
///
/// A page settles once none of its items is claimable and its counter caught
/// up with its item count: completed when nothing failed terminally, failed
/// otherwise.
fn refresh_page_status(conn: &Connection, page_id: i64) -> StorageResult<PageStatus> {
    let page = load_page(conn, page_id)?;
    if page.discovered_at.is_none() {
        return Ok(page.status);
    }

    let (open, failed): (i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN status IN ('pending', 'running', 'failed') THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'failed_terminal' THEN 1 ELSE 0 END), 0)
         FROM item_units WHERE page_unit_id = ?1",
        params![page_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let next = if open == 0 && page.processed_items >= page.total_items {
        if failed > 0 {
            PageStatus::Failed
        } else {
            PageStatus::Completed
        }
    } else {
        PageStatus::Running
    };

    if next != page.status {
        conn.execute(
            "UPDATE page_units SET status = ?1 WHERE id = ?2",
            params![next.to_db_string(), page_id],
        )?;
    }

    Ok(next)
}

/// Identity of an item about to reach a terminal status
struct TerminalTarget {
    id: i64,
    page_unit_id: Option<i64>,
    counted: bool,
}

/// Writes a terminal status and bumps the owning page counter at most once
fn apply_terminal(
    conn: &Connection,
    target: &TerminalTarget,
    status: ItemStatus,
    error: Option<&str>,
    attempted: bool,
) -> StorageResult<()> {
    conn.execute(
        "UPDATE item_units SET
            status = ?1,
            last_error = CASE WHEN ?1 = 'success' THEN NULL ELSE COALESCE(?2, last_error) END,
            retry_count = retry_count + ?3,
            detail_fetched = CASE WHEN ?1 = 'success' THEN 1 ELSE detail_fetched END,
            counted = 1
         WHERE id = ?4",
        params![status.to_db_string(), error, attempted as i64, target.id],
    )?;

    if let Some(page_id) = target.page_unit_id {
        if !target.counted {
            conn.execute(
                "UPDATE page_units SET processed_items = processed_items + 1 WHERE id = ?1",
                params![page_id],
            )?;
        }
        refresh_page_status(conn, page_id)?;
    }

    Ok(())
}

/// Reopens pages and the job that regained claimable items
fn reopen_parents(conn: &Connection, job_id: i64) -> StorageResult<()> {
    conn.execute(
        "UPDATE page_units SET status = 'running'
         WHERE crawl_job_id = ?1
           AND discovered_at IS NOT NULL
           AND status IN ('completed', 'failed')
           AND id IN (SELECT page_unit_id FROM item_units
                      WHERE status = 'pending' AND page_unit_id IS NOT NULL)",
        params![job_id],
    )?;
    conn.execute(
        "UPDATE crawl_jobs SET status = 'running' WHERE id = ?1 AND status IN ('completed', 'failed')",
        params![job_id],
    )?;
    Ok(())
}

impl ProgressStore for SqliteProgressStore {
    // ===== Job Management =====

    fn upsert_job(&mut self, task_type: &str, config_hash: &str) -> StorageResult<CrawlJobRecord> {
        self.conn.execute(
            "INSERT INTO crawl_jobs (task_type, config_hash) VALUES (?1, ?2)
             ON CONFLICT(task_type) DO UPDATE SET config_hash = excluded.config_hash",
            params![task_type, config_hash],
        )?;

        self.get_job_by_task_type(task_type)?.ok_or_else(|| {
            StorageError::Database(format!("job '{}' vanished after upsert", task_type))
        })
    }

    fn get_job(&self, job_id: i64) -> StorageResult<CrawlJobRecord> {
        load_job(&self.conn, job_id)
    }

    fn get_job_by_task_type(&self, task_type: &str) -> StorageResult<Option<CrawlJobRecord>> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {} FROM crawl_jobs WHERE task_type = ?1", JOB_COLUMNS),
                params![task_type],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs(&self) -> StorageResult<Vec<CrawlJobRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM crawl_jobs ORDER BY id", JOB_COLUMNS))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn active_jobs(&self) -> StorageResult<Vec<CrawlJobRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM crawl_jobs WHERE status IN ('pending', 'running') ORDER BY id",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn update_job_status(
        &mut self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> StorageResult<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_job(&tx, job_id)?.status;

        if !current.can_transition_to(status) {
            return Err(StorageError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        tx.execute(
            "UPDATE crawl_jobs SET status = ?1, last_error = COALESCE(?2, last_error) WHERE id = ?3",
            params![status.to_db_string(), error, job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn reopen_job(&mut self, job_id: i64) -> StorageResult<bool> {
        let job = load_job(&self.conn, job_id)?;
        if !job.status.can_reopen() {
            return Ok(false);
        }

        self.conn.execute(
            "UPDATE crawl_jobs SET status = 'running', last_error = NULL WHERE id = ?1",
            params![job_id],
        )?;
        Ok(true)
    }

    fn finalize_job(&mut self, job_id: i64) -> StorageResult<JobStatus> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = load_job(&tx, job_id)?;

        let (total, open, discovered): (i64, i64, i64) = tx.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status IN ('pending', 'running') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN discovered_at IS NOT NULL THEN 1 ELSE 0 END), 0)
             FROM page_units WHERE crawl_job_id = ?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        if job.status != JobStatus::Running || total == 0 || open > 0 {
            return Ok(job.status);
        }

        let next = if discovered == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        tx.execute(
            "UPDATE crawl_jobs SET status = ?1 WHERE id = ?2",
            params![next.to_db_string(), job_id],
        )?;
        tx.commit()?;
        Ok(next)
    }

    fn reset_job(&mut self, job_id: i64) -> StorageResult<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_job(&tx, job_id)?;

        let items = tx.execute(
            "DELETE FROM item_units
             WHERE page_unit_id IN (SELECT id FROM page_units WHERE crawl_job_id = ?1)",
            params![job_id],
        )?;
        let pages = tx.execute(
            "DELETE FROM page_units WHERE crawl_job_id = ?1",
            params![job_id],
        )?;
        tx.execute(
            "UPDATE crawl_jobs SET status = 'pending', last_error = NULL WHERE id = ?1",
            params![job_id],
        )?;
        tx.commit()?;

        Ok(items + pages)
    }

    fn rediscover_job(&mut self, job_id: i64) -> StorageResult<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_job(&tx, job_id)?;

        let pages = tx.execute(
            "UPDATE page_units SET status = 'pending', retry_count = 0, last_error = NULL,
                discovered_at = NULL
             WHERE crawl_job_id = ?1",
            params![job_id],
        )?;
        tx.execute(
            "UPDATE crawl_jobs SET status = 'running', last_error = NULL
             WHERE id = ?1 AND status IN ('completed', 'failed')",
            params![job_id],
        )?;
        tx.commit()?;

        Ok(pages)
    }

    // ===== Page Management =====

    fn upsert_page(
        &mut self,
        job_id: i64,
        relation_id: i64,
        page_number: u32,
    ) -> StorageResult<PageRecord> {
        // New pages inherit the page count already learned for the relation
        self.conn.execute(
            "INSERT INTO page_units (crawl_job_id, relation_id, page_number, total_pages)
             VALUES (?1, ?2, ?3, COALESCE(
                (SELECT MAX(total_pages) FROM page_units
                 WHERE crawl_job_id = ?1 AND relation_id = ?2), 0))
             ON CONFLICT(crawl_job_id, relation_id, page_number) DO NOTHING",
            params![job_id, relation_id, page_number],
        )?;

        let page = self.conn.query_row(
            &format!(
                "SELECT {} FROM page_units
                 WHERE crawl_job_id = ?1 AND relation_id = ?2 AND page_number = ?3",
                PAGE_COLUMNS
            ),
            params![job_id, relation_id, page_number],
            page_from_row,
        )?;
        Ok(page)
    }

    fn get_page(&self, page_id: i64) -> StorageResult<PageRecord> {
        load_page(&self.conn, page_id)
    }

    fn pages_for_job(&self, job_id: i64) -> StorageResult<Vec<PageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM page_units WHERE crawl_job_id = ?1 ORDER BY relation_id, page_number",
            PAGE_COLUMNS
        ))?;
        let pages = stmt
            .query_map(params![job_id], page_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    fn open_pages(&self, job_id: i64) -> StorageResult<Vec<PageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM page_units
             WHERE crawl_job_id = ?1
               AND discovered_at IS NOT NULL
               AND status NOT IN ('completed', 'failed')
             ORDER BY relation_id, page_number",
            PAGE_COLUMNS
        ))?;
        let pages = stmt
            .query_map(params![job_id], page_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    fn claim_pending_pages(
        &mut self,
        job_id: i64,
        limit: usize,
    ) -> StorageResult<Vec<PageRecord>> {
        let stale = self.stale_modifier();
        let max_attempts = self.policy.max_attempts;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Pages abandoned after their last allowed attempt are settled first
        tx.execute(
            "UPDATE page_units SET status = 'failed'
             WHERE crawl_job_id = ?1
               AND discovered_at IS NULL
               AND retry_count >= ?2
               AND (status = 'pending'
                    OR (status = 'running'
                        AND updated_at < strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?3)))",
            params![job_id, max_attempts, stale],
        )?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM page_units
                 WHERE crawl_job_id = ?1
                   AND discovered_at IS NULL
                   AND retry_count < ?2
                   AND (status = 'pending'
                        OR (status = 'running'
                            AND updated_at < strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?3)))
                 ORDER BY relation_id, page_number
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![job_id, max_attempts, stale, limit as i64],
                |row| row.get(0),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for id in &ids {
            tx.execute(
                "UPDATE page_units
                 SET status = 'running', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1",
                params![id],
            )?;
        }

        let pages = ids
            .iter()
            .map(|id| load_page(&tx, *id))
            .collect::<StorageResult<Vec<_>>>()?;
        tx.commit()?;

        Ok(pages)
    }

    fn record_listing(
        &mut self,
        page_id: i64,
        listing: &DiscoveredListing,
        max_pages: Option<u32>,
    ) -> StorageResult<ListingOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let page = load_page(&tx, page_id)?;

        let mut new_items = 0;
        for item in &listing.items {
            new_items += tx.execute(
                "INSERT INTO item_units (code, genre_id, page_unit_id, url, page_number)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(code, genre_id) DO NOTHING",
                params![
                    item.code,
                    page.relation_id,
                    page_id,
                    item.url,
                    page.page_number
                ],
            )?;
        }

        let total_items: u32 = tx.query_row(
            "SELECT COUNT(*) FROM item_units WHERE page_unit_id = ?1",
            params![page_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "UPDATE page_units
             SET total_items = ?1,
                 discovered_at = COALESCE(discovered_at, strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                 status = 'running',
                 last_error = NULL
             WHERE id = ?2",
            params![total_items, page_id],
        )?;

        let mut pages_created = 0;
        if let Some(reported) = listing.total_pages {
            let total_pages = max_pages.map_or(reported, |cap| reported.min(cap));

            tx.execute(
                "UPDATE page_units SET total_pages = ?1 WHERE crawl_job_id = ?2 AND relation_id = ?3",
                params![total_pages, page.crawl_job_id, page.relation_id],
            )?;

            for page_number in 1..=total_pages {
                pages_created += tx.execute(
                    "INSERT INTO page_units (crawl_job_id, relation_id, page_number, total_pages)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(crawl_job_id, relation_id, page_number) DO NOTHING",
                    params![page.crawl_job_id, page.relation_id, page_number, total_pages],
                )?;
            }
        }

        let page_status = refresh_page_status(&tx, page_id)?;
        tx.commit()?;

        Ok(ListingOutcome {
            new_items,
            total_items,
            pages_created,
            page_status,
        })
    }

    fn record_page_attempt_failure(&mut self, page_id: i64, error: &str) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE page_units SET retry_count = retry_count + 1, last_error = ?1 WHERE id = ?2",
            params![error, page_id],
        )?;
        if changed == 0 {
            return Err(StorageError::PageNotFound(page_id));
        }
        Ok(())
    }

    fn mark_page_failed(
        &mut self,
        page_id: i64,
        error: &str,
        attempted: bool,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE page_units
             SET status = 'failed', last_error = ?1, retry_count = retry_count + ?2
             WHERE id = ?3",
            params![error, attempted as i64, page_id],
        )?;
        if changed == 0 {
            return Err(StorageError::PageNotFound(page_id));
        }
        Ok(())
    }

    fn release_page(&mut self, page_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE page_units SET status = 'pending'
             WHERE id = ?1 AND discovered_at IS NULL AND status = 'running'",
            params![page_id],
        )?;
        Ok(())
    }

    // ===== Item Management =====

    fn get_item(&self, key: &ItemKey) -> StorageResult<Option<ItemRecord>> {
        let item = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM item_units WHERE code = ?1 AND genre_id = ?2",
                    ITEM_COLUMNS
                ),
                params![key.code, key.genre_id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    fn items_for_page(&self, page_id: i64) -> StorageResult<Vec<ItemRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM item_units WHERE page_unit_id = ?1 ORDER BY id",
            ITEM_COLUMNS
        ))?;
        let items = stmt
            .query_map(params![page_id], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn claim_pending_items(
        &mut self,
        scope: ItemScope,
        limit: usize,
    ) -> StorageResult<Vec<ItemRecord>> {
        let (scope_filter, scope_id) = match scope {
            ItemScope::Page(page_id) => ("page_unit_id = ?1", page_id),
            ItemScope::Job(job_id) => (
                "page_unit_id IN (SELECT id FROM page_units WHERE crawl_job_id = ?1)",
                job_id,
            ),
        };
        let stale = self.stale_modifier();
        let max_attempts = self.policy.max_attempts;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Items whose budget ran out while nobody held them are settled first
        let exhausted: Vec<TerminalTarget> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id, page_unit_id, counted FROM item_units
                 WHERE {}
                   AND retry_count >= ?2
                   AND (status IN ('pending', 'failed')
                        OR (status = 'running'
                            AND updated_at < strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?3)))",
                scope_filter
            ))?;
            let rows = stmt.query_map(params![scope_id, max_attempts, stale], |row| {
                Ok(TerminalTarget {
                    id: row.get(0)?,
                    page_unit_id: row.get(1)?,
                    counted: row.get(2)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for target in &exhausted {
            apply_terminal(&tx, target, ItemStatus::FailedTerminal, None, false)?;
        }

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM item_units
                 WHERE {}
                   AND retry_count < ?2
                   AND (status IN ('pending', 'failed')
                        OR (status = 'running'
                            AND updated_at < strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?3)))
                 ORDER BY id
                 LIMIT ?4",
                scope_filter
            ))?;
            let rows = stmt.query_map(
                params![scope_id, max_attempts, stale, limit as i64],
                |row| row.get(0),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for id in &ids {
            tx.execute(
                "UPDATE item_units
                 SET status = 'running', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1",
                params![id],
            )?;
        }

        let items = ids
            .iter()
            .map(|id| load_item(&tx, *id))
            .collect::<StorageResult<Vec<_>>>()?;
        tx.commit()?;

        Ok(items)
    }

    fn record_item_attempt_failure(&mut self, key: &ItemKey, error: &str) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE item_units SET retry_count = retry_count + 1, last_error = ?1
             WHERE code = ?2 AND genre_id = ?3 AND status NOT IN ('success', 'failed_terminal')",
            params![error, key.code, key.genre_id],
        )?;

        if changed == 0 && self.get_item(key)?.is_none() {
            return Err(StorageError::ItemNotFound(key.to_string()));
        }
        Ok(())
    }

    fn mark_item_result(&mut self, key: &ItemKey, outcome: &ItemOutcome) -> StorageResult<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                "SELECT id, page_unit_id, counted, status FROM item_units
                 WHERE code = ?1 AND genre_id = ?2",
                params![key.code, key.genre_id],
                |row| {
                    Ok((
                        TerminalTarget {
                            id: row.get(0)?,
                            page_unit_id: row.get(1)?,
                            counted: row.get(2)?,
                        },
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let (target, status) = row.ok_or_else(|| StorageError::ItemNotFound(key.to_string()))?;

        if ItemStatus::from_db_string(&status).is_some_and(|s| s.is_terminal()) {
            return Ok(false);
        }

        match outcome {
            ItemOutcome::Success => {
                apply_terminal(&tx, &target, ItemStatus::Success, None, false)?;
            }
            ItemOutcome::Failed { error, attempted } => {
                apply_terminal(
                    &tx,
                    &target,
                    ItemStatus::FailedTerminal,
                    Some(error),
                    *attempted,
                )?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    fn release_item(&mut self, key: &ItemKey) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE item_units
             SET status = CASE WHEN retry_count > 0 THEN 'failed' ELSE 'pending' END
             WHERE code = ?1 AND genre_id = ?2 AND status = 'running'",
            params![key.code, key.genre_id],
        )?;
        Ok(())
    }

    fn requeue_item(&mut self, key: &ItemKey) -> StorageResult<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let owner: Option<Option<i64>> = tx
            .query_row(
                "SELECT page_unit_id FROM item_units WHERE code = ?1 AND genre_id = ?2",
                params![key.code, key.genre_id],
                |row| row.get(0),
            )
            .optional()?;
        let page_unit_id = owner.ok_or_else(|| StorageError::ItemNotFound(key.to_string()))?;

        // A running item belongs to a live worker; pending and successful ones need nothing
        let changed = tx.execute(
            "UPDATE item_units SET status = 'pending', retry_count = 0, last_error = NULL
             WHERE code = ?1 AND genre_id = ?2 AND status IN ('failed', 'failed_terminal')",
            params![key.code, key.genre_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        if let Some(page_id) = page_unit_id {
            let job_id = load_page(&tx, page_id)?.crawl_job_id;
            reopen_parents(&tx, job_id)?;
        }

        tx.commit()?;
        Ok(true)
    }

    fn requeue_failed(&mut self, job_id: i64) -> StorageResult<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_job(&tx, job_id)?;

        let items = tx.execute(
            "UPDATE item_units SET status = 'pending', retry_count = 0, last_error = NULL
             WHERE status IN ('failed', 'failed_terminal')
               AND page_unit_id IN (SELECT id FROM page_units WHERE crawl_job_id = ?1)",
            params![job_id],
        )?;
        let pages = tx.execute(
            "UPDATE page_units SET status = 'pending', retry_count = 0, last_error = NULL
             WHERE crawl_job_id = ?1 AND discovered_at IS NULL AND status = 'failed'",
            params![job_id],
        )?;

        if items + pages > 0 {
            reopen_parents(&tx, job_id)?;
        }
        tx.commit()?;

        Ok(items + pages)
    }

    // ===== Statistics =====

    fn count_items_by_status(&self, job_id: i64) -> StorageResult<HashMap<ItemStatus, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM item_units
             WHERE page_unit_id IN (SELECT id FROM page_units WHERE crawl_job_id = ?1)
             GROUP BY status",
        )?;

        let mut counts = HashMap::new();
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = ItemStatus::from_db_string(&status) {
                counts.insert(status, count as u64);
            }
        }

        Ok(counts)
    }

    fn job_summary(&self, job_id: i64) -> StorageResult<JobSummary> {
        let job = load_job(&self.conn, job_id)?;

        let (pages_total, pages_completed, pages_failed): (i64, i64, i64) =
            self.conn.query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM page_units WHERE crawl_job_id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        let counts = self.count_items_by_status(job_id)?;
        let count = |status: ItemStatus| counts.get(&status).copied().unwrap_or(0);

        Ok(JobSummary {
            job,
            pages_total: pages_total as u64,
            pages_completed: pages_completed as u64,
            pages_failed: pages_failed as u64,
            items_success: count(ItemStatus::Success),
            items_failed_terminal: count(ItemStatus::FailedTerminal),
            items_pending: count(ItemStatus::Pending)
                + count(ItemStatus::Running)
                + count(ItemStatus::Failed),
        })
    }
}
