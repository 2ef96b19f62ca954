//! JSON Lines item sink
//!
//! Appends one line per fetched item. Detail-field extraction is left to
//! downstream tooling; the line records where the page came from and how
//! large it was.

use crate::crawler::{ItemSink, ParseError};
use crate::fetch::FetchResult;
use crate::storage::ItemRecord;
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// One line of the items file
#[derive(Debug, Serialize)]
struct ItemLine<'a> {
    code: &'a str,
    genre_id: i64,
    url: &'a str,
    final_url: &'a str,
    status_code: u16,
    body_bytes: usize,
    fetched_at: String,
}

/// Item sink writing to a JSON Lines file
pub struct JsonlItemSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlItemSink {
    /// Opens the file for appending, creating it and its directory if needed
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl ItemSink for JsonlItemSink {
    fn accept(&self, item: &ItemRecord, page: &FetchResult) -> Result<(), ParseError> {
        if page.body.trim().is_empty() {
            return Err(ParseError::Unusable(format!(
                "empty detail page for {}",
                item.code
            )));
        }

        let line = ItemLine {
            code: &item.code,
            genre_id: item.genre_id,
            url: &item.url,
            final_url: &page.final_url,
            status_code: page.status_code,
            body_bytes: page.body.len(),
            fetched_at: Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string(&line).map_err(|e| ParseError::Persist(e.to_string()))?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ParseError::Persist("items file lock poisoned".to_string()))?;
        writeln!(writer, "{}", json).map_err(|e| ParseError::Persist(e.to_string()))?;
        // Items are marked done right after this returns
        writer
            .flush()
            .map_err(|e| ParseError::Persist(e.to_string()))?;
        Ok(())
    }
}
