use crate::fetch::FetchMode;
use serde::Deserialize;

/// Main configuration structure for reelcrawl
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub site: SiteConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub catalogue: Vec<CatalogueEntry>,
}

impl Config {
    /// Looks up the catalogue entry driving the given task type
    pub fn catalogue_for(&self, task_type: &str) -> Option<&CatalogueEntry> {
        self.catalogue.iter().find(|c| c.task_type == task_type)
    }
}

/// Target site configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Base URL of the catalogue, e.g. "https://catalogue.example"
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// User agent sent with every HTTP request
    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout for plain HTTP fetches (seconds)
    #[serde(rename = "request-timeout-secs", default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Login and session caching configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Path of the page visited before submitting credentials
    #[serde(rename = "login-page", default = "default_login_page")]
    pub login_page: String,

    /// Path of the JSON sign-in endpoint
    #[serde(rename = "login-endpoint", default = "default_login_endpoint")]
    pub login_endpoint: String,

    /// Cookie names that identify an authenticated session
    #[serde(rename = "session-cookies", default = "default_session_cookies")]
    pub session_cookies: Vec<String>,

    /// How long an acquired session is reused (seconds)
    #[serde(rename = "session-ttl-secs", default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Login round trips attempted before giving up
    #[serde(rename = "login-attempts", default = "default_login_attempts")]
    pub login_attempts: u32,

    /// Operator-managed cookie header; disables automatic login entirely
    #[serde(rename = "manual-session", default)]
    pub manual_session: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            login_page: default_login_page(),
            login_endpoint: default_login_endpoint(),
            session_cookies: default_session_cookies(),
            session_ttl_secs: default_session_ttl(),
            login_attempts: default_login_attempts(),
            manual_session: None,
        }
    }
}

/// Retry and backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum fetch attempts per unit of work
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    #[serde(rename = "backoff-base-ms", default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound for the exponential delay (milliseconds)
    #[serde(rename = "backoff-cap-ms", default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Random spread applied to each delay, as a percentage
    #[serde(rename = "jitter-percent", default = "default_jitter_percent")]
    pub jitter_percent: u32,

    /// Multiplier applied to the delay after an anti-bot interstitial
    #[serde(
        rename = "anti-bot-backoff-factor",
        default = "default_anti_bot_factor"
    )]
    pub anti_bot_backoff_factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            jitter_percent: default_jitter_percent(),
            anti_bot_backoff_factor: default_anti_bot_factor(),
        }
    }
}

/// Browser worker allocation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    Single,
    Multi,
}

/// Browser pool and readiness configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_pool_mode")]
    pub mode: PoolMode,

    /// Number of browser workers (must be 1 in single mode)
    #[serde(rename = "pool-size", default = "default_pool_size")]
    pub pool_size: u32,

    /// Directory under which worker profiles are created
    #[serde(rename = "profile-root", default = "default_profile_root")]
    pub profile_root: String,

    #[serde(default = "default_headless")]
    pub headless: bool,

    /// How long a rendered page may take to become ready (seconds)
    #[serde(rename = "ready-timeout-secs", default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Delay between readiness polls (milliseconds)
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Body text length above which a page counts as loaded
    #[serde(rename = "min-text-length", default = "default_min_text_length")]
    pub min_text_length: usize,

    /// CSS selectors whose presence marks real content
    #[serde(rename = "content-markers", default)]
    pub content_markers: Option<Vec<String>>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            mode: default_pool_mode(),
            pool_size: default_pool_size(),
            profile_root: default_profile_root(),
            headless: default_headless(),
            ready_timeout_secs: default_ready_timeout(),
            poll_interval_ms: default_poll_interval(),
            min_text_length: default_min_text_length(),
            content_markers: None,
        }
    }
}

/// Claim batching configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Units claimed from the progress store per batch
    #[serde(rename = "batch-size", default = "default_batch_size")]
    pub batch_size: u32,

    /// Age after which a running unit is considered abandoned (seconds)
    #[serde(rename = "stale-after-secs", default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            stale_after_secs: default_stale_after(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite progress database
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Path of the JSON Lines file receiving fetched items
    #[serde(rename = "items-path", default = "default_items_path")]
    pub items_path: String,
}

/// One catalogue traversal, persisted as a crawl job
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogueEntry {
    /// Unique task type, e.g. "genre_listing" or "feed"
    #[serde(rename = "task-type")]
    pub task_type: String,

    /// Relation ids (genre ids) walked by this job
    #[serde(default = "default_relations")]
    pub relations: Vec<i64>,

    /// Listing URL template with `{relation}` and `{page}` placeholders
    #[serde(rename = "listing-url")]
    pub listing_url: String,

    #[serde(rename = "listing-mode", default = "default_listing_mode")]
    pub listing_mode: FetchMode,

    #[serde(rename = "detail-mode", default = "default_detail_mode")]
    pub detail_mode: FetchMode,

    /// Upper bound on pages created per relation
    #[serde(rename = "max-pages", default)]
    pub max_pages: Option<u32>,
}

fn default_user_agent() -> String {
    format!("reelcrawl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout() -> u64 {
    30
}

fn default_login_page() -> String {
    "/ja".to_string()
}

fn default_login_endpoint() -> String {
    "/ja/ajax/user/signin".to_string()
}

fn default_session_cookies() -> Vec<String> {
    vec!["session".to_string(), "x-token".to_string()]
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_login_attempts() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    2000
}

fn default_backoff_cap() -> u64 {
    30_000
}

fn default_jitter_percent() -> u32 {
    20
}

fn default_anti_bot_factor() -> u32 {
    3
}

fn default_pool_mode() -> PoolMode {
    PoolMode::Single
}

fn default_pool_size() -> u32 {
    1
}

fn default_profile_root() -> String {
    "./profiles".to_string()
}

fn default_headless() -> bool {
    true
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_min_text_length() -> usize {
    1000
}

fn default_batch_size() -> u32 {
    2
}

fn default_stale_after() -> u64 {
    600
}

fn default_items_path() -> String {
    "./items.jsonl".to_string()
}

fn default_relations() -> Vec<i64> {
    vec![0]
}

fn default_listing_mode() -> FetchMode {
    FetchMode::Http
}

fn default_detail_mode() -> FetchMode {
    FetchMode::Rendered
}
