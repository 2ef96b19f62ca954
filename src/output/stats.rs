//! Statistics generation from the progress database
//!
//! This module provides functionality for extracting and displaying
//! crawl progress from the storage layer.

use crate::crawler::RunSummary;
use crate::state::ItemStatus;
use crate::storage::{JobSummary, ProgressStore};
use crate::CrawlError;
use std::collections::HashMap;

/// Progress of one job with its item status breakdown
#[derive(Debug, Clone)]
pub struct JobStatistics {
    pub summary: JobSummary,

    /// Count of items by status
    pub items_by_status: HashMap<ItemStatus, u64>,
}

/// Crawl statistics across every job in the store
#[derive(Debug, Clone, Default)]
pub struct CrawlStatistics {
    pub jobs: Vec<JobStatistics>,
}

impl CrawlStatistics {
    pub fn total_items(&self) -> u64 {
        self.jobs.iter().map(|j| j.summary.items_total()).sum()
    }
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `store` - The progress store to query
///
/// # Returns
///
/// * `Ok(CrawlStatistics)` - Successfully loaded statistics
/// * `Err(CrawlError)` - Failed to query statistics
pub fn load_statistics(store: &dyn ProgressStore) -> Result<CrawlStatistics, CrawlError> {
    let mut jobs = Vec::new();

    for job in store.list_jobs()? {
        let summary = store.job_summary(job.id)?;
        let items_by_status = store.count_items_by_status(job.id)?;
        jobs.push(JobStatistics {
            summary,
            items_by_status,
        });
    }

    Ok(CrawlStatistics { jobs })
}

fn success_rate(summary: &JobSummary) -> f64 {
    let total = summary.items_total();
    if total > 0 {
        (summary.items_success as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Crawl Statistics ===\n");

    if stats.jobs.is_empty() {
        println!("No crawl jobs recorded yet.");
        return;
    }

    for job in &stats.jobs {
        let summary = &job.summary;
        println!("Job '{}' ({}):", summary.job.task_type, summary.job.status);
        println!("  Last update: {}", summary.job.updated_at);
        if let Some(error) = &summary.job.last_error {
            println!("  Last error: {}", error);
        }
        println!(
            "  Listing pages: {} total, {} completed, {} failed",
            summary.pages_total, summary.pages_completed, summary.pages_failed
        );

        println!("  Items by status:");
        for status in ItemStatus::all_states() {
            let count = job.items_by_status.get(&status).copied().unwrap_or(0);
            if count > 0 {
                println!("    {}: {}", status, count);
            }
        }

        println!(
            "  Success rate: {:.1}% ({} / {} items)",
            success_rate(summary),
            summary.items_success,
            summary.items_total()
        );
        println!();
    }

    println!("Total items: {}", stats.total_items());
}

/// Prints the outcome of a scheduler run
pub fn print_run_summary(summary: &RunSummary) {
    println!("\n=== Run Summary ===\n");

    for job in &summary.jobs {
        println!(
            "  {:<20} {:<10} {:>6} succeeded {:>6} failed {:>6} pending",
            job.job.task_type,
            job.job.status.to_db_string(),
            job.items_success,
            job.items_failed_terminal,
            job.items_pending
        );
    }

    println!();
    println!(
        "Items: {} succeeded, {} failed, {} pending",
        summary.items_success(),
        summary.items_failed_terminal(),
        summary.items_pending()
    );
    println!("Logins: {}", summary.logins);

    if summary.interrupted {
        println!("Run interrupted; run again to resume.");
    }
}
