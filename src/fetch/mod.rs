//! Fetch module for retrieving listing and detail pages
//!
//! This module contains everything between a URL and its body:
//! - Plain HTTP fetching with the session cookie header
//! - Rendered fetching through a pool of browser workers
//! - Readiness polling and anti-bot interstitial detection
//! - Mapping of HTTP statuses onto the fetch error taxonomy

mod browser;
mod http;
mod pool;
pub mod readiness;

pub use browser::{
    BlockingDriver, BlockingDriverAdapter, BrowserDriver, BrowserLauncher, BrowserProfile,
    BrowserWorker,
};
pub use http::{build_http_client, HttpFetcher};
pub use pool::{build_worker_pool, MultiWorkerPool, SingleWorkerPool, WorkerPool};
pub use readiness::{PageSnapshot, ReadinessPolicy, ReadinessVerdict};

use crate::auth::Session;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How a page is retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Plain HTTP GET
    Http,
    /// Loaded in a browser worker and polled until ready
    Rendered,
}

impl std::fmt::Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Rendered => write!(f, "rendered"),
        }
    }
}

/// A successfully retrieved page
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status_code: u16,
    pub body: String,
    /// URL after redirects
    pub final_url: String,
}

/// Per-unit fetch failures
///
/// None of these abort a run; they are recorded against the unit and fed to
/// the retry policy.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("session rejected with status {status}")]
    SessionExpired { status: u16 },

    #[error("{url} not ready after {waited:?}")]
    PageNotReady { url: String, waited: Duration },

    #[error("anti-bot interstitial at {url}")]
    AntiBotBlocked { url: String },

    #[error("{url} returned {status}")]
    NotFound { url: String, status: u16 },

    #[error("{0}")]
    ParseFailure(String),

    #[error("{url} returned {status}")]
    HttpStatus { status: u16, url: String },

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Browser(String),

    #[error("{0}")]
    Unsupported(String),
}

impl FetchError {
    /// Short tag persisted in front of the message
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionExpired { .. } => "session_expired",
            Self::PageNotReady { .. } => "page_not_ready",
            Self::AntiBotBlocked { .. } => "anti_bot_blocked",
            Self::NotFound { .. } => "not_found",
            Self::ParseFailure(_) => "parse_failure",
            Self::HttpStatus { .. } => "http_status",
            Self::Transport(_) => "transport",
            Self::Browser(_) => "browser",
            Self::Unsupported(_) => "unsupported",
        }
    }

    /// Formats the error the way it is stored in `last_error`
    pub fn tagged(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    /// Maps a non-success HTTP status onto the taxonomy
    ///
    /// # Arguments
    ///
    /// * `status` - The response status code
    /// * `url` - The requested URL
    /// * `auth_challenge` - Whether the response carried a `WWW-Authenticate` challenge
    ///
    /// # Returns
    ///
    /// `None` for 2xx statuses
    pub fn from_status(status: u16, url: &str, auth_challenge: bool) -> Option<Self> {
        match status {
            200..=299 => None,
            401 => Some(Self::SessionExpired { status }),
            403 if auth_challenge => Some(Self::SessionExpired { status }),
            404 | 410 => Some(Self::NotFound {
                url: url.to_string(),
                status,
            }),
            _ => Some(Self::HttpStatus {
                status,
                url: url.to_string(),
            }),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Transport(e.to_string())
    }
}

/// Markup of the sign-in form served in place of content
const LOGIN_FORM_SELECTORS: &[&str] = &["form[action*=\"signin\"]", "input[name=\"username\"]"];

/// Whether a response is the sign-in page rather than the requested page
///
/// Expired sessions are often answered with a redirect to the login page or
/// with the login form itself instead of a 401.
pub fn is_login_page(final_url: &str, body: &str) -> bool {
    let redirected = url::Url::parse(final_url)
        .map(|u| {
            let path = u.path();
            path.contains("/login") || path.contains("signin")
        })
        .unwrap_or(false);
    if redirected {
        return true;
    }

    let document = Html::parse_document(body);
    LOGIN_FORM_SELECTORS.iter().any(|css| {
        Selector::parse(css)
            .map(|selector| document.select(&selector).next().is_some())
            .unwrap_or(false)
    })
}

/// Failure shown by a loaded page that waiting cannot turn into content
///
/// Catches statuses that reject the session or the URL itself, and a landing
/// on the sign-in page. Browsers do not expose response headers, so a 403 is
/// never read as a session challenge here.
pub fn landing_failure(
    status: Option<u16>,
    url: &str,
    final_url: &str,
    body: &str,
) -> Option<FetchError> {
    if let Some(err @ (FetchError::SessionExpired { .. } | FetchError::NotFound { .. })) =
        status.and_then(|s| FetchError::from_status(s, url, false))
    {
        return Some(err);
    }

    if is_login_page(final_url, body) {
        return Some(FetchError::SessionExpired {
            status: status.unwrap_or(200),
        });
    }
    None
}

/// Retrieves pages on behalf of the scheduler
#[async_trait]
pub trait FetchClient: Send + Sync {
    /// Fetches a URL with the given session
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute URL to fetch
    /// * `mode` - Plain HTTP or rendered in a browser worker
    /// * `session` - Session whose cookies authenticate the request
    async fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
        session: &Session,
    ) -> Result<FetchResult, FetchError>;
}

/// Fetch client dispatching on [`FetchMode`]
pub struct SessionFetcher {
    http: HttpFetcher,
    pool: Option<Arc<dyn WorkerPool>>,
}

impl SessionFetcher {
    /// Creates a fetcher without browser workers; rendered fetches fail
    pub fn new(http: HttpFetcher) -> Self {
        Self { http, pool: None }
    }

    /// Creates a fetcher that renders through the given pool
    pub fn with_pool(http: HttpFetcher, pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            http,
            pool: Some(pool),
        }
    }

    /// Number of units that may be fetched at once
    pub fn concurrency(&self) -> usize {
        self.pool.as_ref().map_or(1, |pool| pool.size().max(1))
    }

    /// Closes every browser worker
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
    }
}

#[async_trait]
impl FetchClient for SessionFetcher {
    async fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
        session: &Session,
    ) -> Result<FetchResult, FetchError> {
        match mode {
            FetchMode::Http => self.http.get(url, session).await,
            FetchMode::Rendered => match &self.pool {
                Some(pool) => pool.render(url, session).await,
                None => Err(FetchError::Unsupported(format!(
                    "rendered fetch of {} requires a browser pool",
                    url
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(FetchError::from_status(200, "u", false).is_none());
        assert!(matches!(
            FetchError::from_status(401, "u", false),
            Some(FetchError::SessionExpired { status: 401 })
        ));
        assert!(matches!(
            FetchError::from_status(403, "u", true),
            Some(FetchError::SessionExpired { status: 403 })
        ));
        assert!(matches!(
            FetchError::from_status(403, "u", false),
            Some(FetchError::HttpStatus { status: 403, .. })
        ));
        assert!(matches!(
            FetchError::from_status(410, "u", false),
            Some(FetchError::NotFound { status: 410, .. })
        ));
        assert!(matches!(
            FetchError::from_status(429, "u", false),
            Some(FetchError::HttpStatus { status: 429, .. })
        ));
        assert!(matches!(
            FetchError::from_status(503, "u", false),
            Some(FetchError::HttpStatus { status: 503, .. })
        ));
    }

    #[test]
    fn test_login_page_detection() {
        assert!(is_login_page("https://catalogue.example/ja/login", ""));
        assert!(is_login_page(
            "https://catalogue.example/ja/abc-001",
            "<form action=\"/ja/ajax/user/signin\"><input name=\"username\"></form>"
        ));
        assert!(!is_login_page(
            "https://catalogue.example/ja/abc-001",
            "<h1>ABC-001</h1>"
        ));
    }

    #[test]
    fn test_landing_failure() {
        let url = "https://catalogue.example/ja/abc-001";

        assert!(landing_failure(Some(200), url, url, "<h1>ABC-001</h1>").is_none());
        assert!(landing_failure(None, url, url, "<h1>ABC-001</h1>").is_none());
        assert!(matches!(
            landing_failure(Some(401), url, url, "<h1>401 Unauthorized</h1>"),
            Some(FetchError::SessionExpired { status: 401 })
        ));
        assert!(matches!(
            landing_failure(Some(404), url, url, "<h1>Not Found</h1>"),
            Some(FetchError::NotFound { status: 404, .. })
        ));
        assert!(matches!(
            landing_failure(
                Some(200),
                url,
                "https://catalogue.example/ja/login?next=abc-001",
                "<h1>Sign in</h1>"
            ),
            Some(FetchError::SessionExpired { status: 200 })
        ));
        // Left to readiness, which may still see the challenge resolve
        assert!(landing_failure(Some(503), url, url, "").is_none());
    }

    #[test]
    fn test_tagged_error() {
        let err = FetchError::ParseFailure("missing items".to_string());
        assert_eq!(err.tagged(), "parse_failure: missing items");
    }

    #[tokio::test]
    async fn test_rendered_without_pool_is_unsupported() {
        let http = HttpFetcher::new(reqwest::Client::new());
        let fetcher = SessionFetcher::new(http);
        let session = Session::manual("session=abc");

        let err = fetcher
            .fetch("http://localhost/x", FetchMode::Rendered, &session)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unsupported(_)));
        assert_eq!(fetcher.concurrency(), 1);
    }
}
