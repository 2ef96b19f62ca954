//! State module for tracking crawl progress
//!
//! This module defines the status machines persisted by the progress store.
//!
//! # Components
//!
//! - `JobStatus`: forward-only lifecycle of one catalogue traversal
//! - `PageStatus`: lifecycle of one listing page
//! - `ItemStatus`: lifecycle of one item detail fetch, with retryable and
//!   terminal failures kept apart

mod job_state;
mod unit_state;

// Re-export main types
pub use job_state::JobStatus;
pub use unit_state::{ItemStatus, PageStatus};
