//! reelcrawl: a resumable crawler for authentication-gated video catalogues
//!
//! This crate logs in to a catalogue site, walks its listing pages and fetches
//! per-item detail pages. Progress is persisted in SQLite at job, page and item
//! granularity so a crawl can be killed and resumed without repeating work.

pub mod auth;
pub mod config;
pub mod crawler;
pub mod fetch;
pub mod output;
pub mod retry;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for crawl runs
///
/// Only job-level failures end up here. Failures of a single page or item are
/// recorded in the progress store and never abort a run.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] storage::StorageError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Browser pool error: {0}")]
    Pool(String),

    #[error("No catalogue configured for task type '{0}'")]
    UnknownTaskType(String),

    #[error("Progress store lock poisoned")]
    LockPoisoned,

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for crawl operations
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use auth::{CredentialBroker, Session};
pub use config::Config;
pub use crawler::{CrawlScheduler, RunSummary};
pub use retry::RetryPolicy;
pub use state::{ItemStatus, JobStatus, PageStatus};
pub use storage::{ProgressStore, SqliteProgressStore};
