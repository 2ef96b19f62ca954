//! Output module for fetched items and crawl reports
//!
//! This module handles:
//! - Appending fetched items to a JSON Lines file
//! - Loading and printing progress statistics
//! - Printing the summary of a run

mod jsonl;
pub mod stats;

pub use jsonl::JsonlItemSink;
pub use stats::{load_statistics, print_run_summary, print_statistics, CrawlStatistics};
