//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the progress database.

/// SQL schema for the database
///
/// Timestamps are UTC RFC 3339 text with millisecond precision so they sort
/// lexically. `updated_at` is maintained by triggers unless an update sets it
/// explicitly.
pub const SCHEMA_SQL: &str = r#"
-- One traversal of a catalogue
CREATE TABLE IF NOT EXISTS crawl_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'pending',
    config_hash TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

-- Listing pages of a job
CREATE TABLE IF NOT EXISTS page_units (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    crawl_job_id INTEGER NOT NULL REFERENCES crawl_jobs(id) ON DELETE CASCADE,
    relation_id INTEGER NOT NULL,
    page_number INTEGER NOT NULL,
    total_pages INTEGER NOT NULL DEFAULT 0,
    total_items INTEGER NOT NULL DEFAULT 0,
    processed_items INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    discovered_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE(crawl_job_id, relation_id, page_number)
);

CREATE INDEX IF NOT EXISTS idx_page_units_job ON page_units(crawl_job_id, status);

-- Items awaiting their detail fetch
CREATE TABLE IF NOT EXISTS item_units (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL,
    genre_id INTEGER NOT NULL,
    page_unit_id INTEGER REFERENCES page_units(id) ON DELETE SET NULL,
    url TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    detail_fetched INTEGER NOT NULL DEFAULT 0,
    counted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE(code, genre_id)
);

CREATE INDEX IF NOT EXISTS idx_item_units_page ON item_units(page_unit_id, status);
CREATE INDEX IF NOT EXISTS idx_item_units_status ON item_units(status);

CREATE TRIGGER IF NOT EXISTS trg_crawl_jobs_touch
AFTER UPDATE ON crawl_jobs
FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE crawl_jobs SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_page_units_touch
AFTER UPDATE ON page_units
FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE page_units SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_item_units_touch
AFTER UPDATE ON item_units
FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE item_units SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The SQLite connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn object_exists(conn: &Connection, kind: &str, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
            [kind, name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_schema_creation() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        for table in ["crawl_jobs", "page_units", "item_units"] {
            assert!(object_exists(&conn, "table", table), "missing {}", table);
        }
        for trigger in [
            "trg_crawl_jobs_touch",
            "trg_page_units_touch",
            "trg_item_units_touch",
        ] {
            assert!(object_exists(&conn, "trigger", trigger), "missing {}", trigger);
        }
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
    }

    #[test]
    fn test_item_key_unique() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO item_units (code, genre_id, url, page_number) VALUES ('ABC-001', 7, 'u', 1)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO item_units (code, genre_id, url, page_number) VALUES ('ABC-001', 7, 'u', 1)",
            [],
        );
        assert!(dup.is_err());

        // Same code under another genre is a distinct item
        conn.execute(
            "INSERT INTO item_units (code, genre_id, url, page_number) VALUES ('ABC-001', 8, 'u', 1)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_trigger_touches_updated_at() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO crawl_jobs (task_type, updated_at) VALUES ('feed', '2000-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();
        conn.execute("UPDATE crawl_jobs SET status = 'running'", [])
            .unwrap();

        let updated: String = conn
            .query_row("SELECT updated_at FROM crawl_jobs", [], |row| row.get(0))
            .unwrap();
        assert!(updated.as_str() > "2000-01-01T00:00:00.000Z");
    }
}
