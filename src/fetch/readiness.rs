//! Page readiness and anti-bot interstitial detection
//!
//! A rendered page is ready when it is not an interstitial and it either
//! carries a recognised content marker or enough body text. Each check is a
//! [`ReadinessSignal`]; [`ReadinessPolicy`] runs them in order and combines
//! their verdicts.
//!
//! Evaluation is synchronous. The parsed document never lives across an
//! `.await`.

use crate::config::BrowserConfig;
use crate::fetch::{landing_failure, BrowserDriver, FetchError};
use scraper::{Html, Selector};
use std::time::Duration;
use tokio::time::Instant;

/// Titles shown only by challenge pages
pub const CHALLENGE_TITLES: &[&str] = &["Just a moment", "Attention Required", "安全检查"];

/// Title words challenge pages use but real pages may mention too
pub const WEAK_CHALLENGE_TITLES: &[&str] = &["Cloudflare"];

/// Markup that only appears on challenge pages
pub const STRONG_CHALLENGE_SELECTORS: &[&str] = &["#challenge-form", "#cf-hcaptcha", "#cf-spinner"];

/// Markup that challenge pages carry but real pages may embed too
pub const WEAK_CHALLENGE_SELECTORS: &[&str] = &["script[src*=\"challenge-platform\"]"];

pub const CHALLENGE_TEXTS: &[&str] = &["Checking your browser", "DDoS protection"];

pub const DEFAULT_CONTENT_MARKERS: &[&str] = &[
    "meta[property=\"og:title\"]",
    ".movie-info-panel",
    ".video-player",
    ".movie-detail",
    "h1",
];

/// What a browser (or an HTTP response) currently shows
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub url: String,
    /// Document title as reported by the driver; parsed from the HTML when empty
    pub title: String,
    pub html: String,
    pub status: Option<u16>,
}

/// A parsed snapshot handed to every signal
pub struct PageView<'a> {
    pub snapshot: &'a PageSnapshot,
    pub document: Html,
    pub title: String,
    pub body_text: String,
}

impl<'a> PageView<'a> {
    pub fn parse(snapshot: &'a PageSnapshot) -> Self {
        let document = Html::parse_document(&snapshot.html);

        let title = if snapshot.title.is_empty() {
            select_text(&document, "title")
        } else {
            snapshot.title.clone()
        };
        let body_text = select_text(&document, "body");

        Self {
            snapshot,
            document,
            title,
            body_text,
        }
    }

    fn has_match(&self, selector: &Selector) -> bool {
        self.document.select(selector).next().is_some()
    }

    fn text_len(&self) -> usize {
        self.body_text
            .split_whitespace()
            .map(|word| word.chars().count() + 1)
            .sum()
    }
}

fn select_text(document: &Html, css: &str) -> String {
    Selector::parse(css)
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|element| element.text().collect::<String>())
        })
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

fn parse_selectors(selectors: &[&str]) -> Vec<Selector> {
    selectors
        .iter()
        .filter_map(|css| match Selector::parse(css) {
            Ok(selector) => Some(selector),
            Err(e) => {
                tracing::warn!("Ignoring invalid selector '{}': {}", css, e);
                None
            }
        })
        .collect()
}

/// Outcome of a single signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalVerdict {
    /// Certainly an interstitial
    StrongInterstitial(String),
    /// Looks like an interstitial, unless real content says otherwise
    WeakInterstitial(String),
    /// Real content is present
    Content(String),
    Neutral,
}

/// One readiness check over a parsed page
pub trait ReadinessSignal: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, page: &PageView<'_>) -> SignalVerdict;
}

/// Title of a known challenge page
pub struct ChallengeTitle {
    strong: Vec<String>,
    weak: Vec<String>,
}

impl Default for ChallengeTitle {
    fn default() -> Self {
        Self {
            strong: CHALLENGE_TITLES.iter().map(|s| s.to_string()).collect(),
            weak: WEAK_CHALLENGE_TITLES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ReadinessSignal for ChallengeTitle {
    fn name(&self) -> &str {
        "challenge-title"
    }

    fn evaluate(&self, page: &PageView<'_>) -> SignalVerdict {
        let find = |needles: &[String]| {
            needles
                .iter()
                .find(|n| page.title.contains(n.as_str()))
                .map(|needle| format!("title contains '{}'", needle))
        };

        if let Some(reason) = find(&self.strong) {
            return SignalVerdict::StrongInterstitial(reason);
        }
        match find(&self.weak) {
            Some(reason) => SignalVerdict::WeakInterstitial(reason),
            None => SignalVerdict::Neutral,
        }
    }
}

/// Challenge widgets and scripts
pub struct ChallengeMarkup {
    strong: Vec<Selector>,
    weak: Vec<Selector>,
}

impl Default for ChallengeMarkup {
    fn default() -> Self {
        Self {
            strong: parse_selectors(STRONG_CHALLENGE_SELECTORS),
            weak: parse_selectors(WEAK_CHALLENGE_SELECTORS),
        }
    }
}

impl ReadinessSignal for ChallengeMarkup {
    fn name(&self) -> &str {
        "challenge-markup"
    }

    fn evaluate(&self, page: &PageView<'_>) -> SignalVerdict {
        if self.strong.iter().any(|s| page.has_match(s)) {
            return SignalVerdict::StrongInterstitial("challenge widget present".to_string());
        }
        if self.weak.iter().any(|s| page.has_match(s)) {
            return SignalVerdict::WeakInterstitial("challenge script present".to_string());
        }
        SignalVerdict::Neutral
    }
}

/// Selectors that only real pages carry
pub struct ContentMarkers {
    selectors: Vec<Selector>,
}

impl ContentMarkers {
    pub fn new(markers: &[&str]) -> Self {
        Self {
            selectors: parse_selectors(markers),
        }
    }
}

impl Default for ContentMarkers {
    fn default() -> Self {
        Self::new(DEFAULT_CONTENT_MARKERS)
    }
}

impl ReadinessSignal for ContentMarkers {
    fn name(&self) -> &str {
        "content-markers"
    }

    fn evaluate(&self, page: &PageView<'_>) -> SignalVerdict {
        if self.selectors.iter().any(|s| page.has_match(s)) {
            SignalVerdict::Content("content marker present".to_string())
        } else {
            SignalVerdict::Neutral
        }
    }
}

/// Enough body text to be a real page even without markers
pub struct TextLength {
    min_chars: usize,
}

impl TextLength {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }
}

impl ReadinessSignal for TextLength {
    fn name(&self) -> &str {
        "text-length"
    }

    fn evaluate(&self, page: &PageView<'_>) -> SignalVerdict {
        let len = page.text_len();
        if len > self.min_chars {
            SignalVerdict::Content(format!("{} chars of body text", len))
        } else {
            SignalVerdict::Neutral
        }
    }
}

/// Body text typical of challenge pages
pub struct ChallengeText {
    needles: Vec<String>,
}

impl Default for ChallengeText {
    fn default() -> Self {
        Self {
            needles: CHALLENGE_TEXTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ReadinessSignal for ChallengeText {
    fn name(&self) -> &str {
        "challenge-text"
    }

    fn evaluate(&self, page: &PageView<'_>) -> SignalVerdict {
        match self
            .needles
            .iter()
            .find(|n| page.body_text.contains(n.as_str()))
        {
            Some(needle) => SignalVerdict::WeakInterstitial(format!("body mentions '{}'", needle)),
            None => SignalVerdict::Neutral,
        }
    }
}

/// Why a page is not ready yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReadyReason {
    /// An interstitial is showing
    Challenge(String),
    /// Nothing recognisable yet
    Loading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessVerdict {
    Ready(String),
    NotReady(NotReadyReason),
}

impl ReadinessVerdict {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_challenge(&self) -> bool {
        matches!(self, Self::NotReady(NotReadyReason::Challenge(_)))
    }
}

/// Ordered signals plus the polling budget
pub struct ReadinessPolicy {
    signals: Vec<Box<dyn ReadinessSignal>>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ReadinessPolicy {
    pub fn new(
        signals: Vec<Box<dyn ReadinessSignal>>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            signals,
            timeout,
            poll_interval,
        }
    }

    /// Builds the default signal chain from browser settings
    pub fn from_config(config: &BrowserConfig) -> Self {
        let markers = match &config.content_markers {
            Some(markers) => {
                ContentMarkers::new(&markers.iter().map(String::as_str).collect::<Vec<_>>())
            }
            None => ContentMarkers::default(),
        };

        let signals: Vec<Box<dyn ReadinessSignal>> = vec![
            Box::new(ChallengeTitle::default()),
            Box::new(ChallengeMarkup::default()),
            Box::new(markers),
            Box::new(TextLength::new(config.min_text_length)),
            Box::new(ChallengeText::default()),
        ];

        Self::new(
            signals,
            Duration::from_secs(config.ready_timeout_secs),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Combines the signals over one snapshot
    ///
    /// A strong interstitial ends evaluation. Content wins over any weak
    /// interstitial seen before it. Weak signals alone mean a challenge, and
    /// no signal at all means the page is still loading.
    pub fn evaluate(&self, snapshot: &PageSnapshot) -> ReadinessVerdict {
        let page = PageView::parse(snapshot);
        let mut weak: Option<String> = None;

        for signal in &self.signals {
            match signal.evaluate(&page) {
                SignalVerdict::StrongInterstitial(reason) => {
                    tracing::trace!("{}: {} ({})", snapshot.url, reason, signal.name());
                    return ReadinessVerdict::NotReady(NotReadyReason::Challenge(reason));
                }
                SignalVerdict::Content(reason) => return ReadinessVerdict::Ready(reason),
                SignalVerdict::WeakInterstitial(reason) => {
                    weak.get_or_insert(reason);
                }
                SignalVerdict::Neutral => {}
            }
        }

        match weak {
            Some(reason) => ReadinessVerdict::NotReady(NotReadyReason::Challenge(reason)),
            None => ReadinessVerdict::NotReady(NotReadyReason::Loading),
        }
    }
}

/// Whether a body is unmistakably an interstitial
///
/// Used on plain HTTP responses, where there is nothing to wait for.
pub fn is_strong_interstitial(html: &str) -> bool {
    let snapshot = PageSnapshot {
        html: html.to_string(),
        ..Default::default()
    };
    let page = PageView::parse(&snapshot);

    let title = ChallengeTitle::default();
    let markup = ChallengeMarkup::default();
    let strong: [&dyn ReadinessSignal; 2] = [&title, &markup];
    strong
        .iter()
        .any(|signal| matches!(signal.evaluate(&page), SignalVerdict::StrongInterstitial(_)))
}

/// Polls a driver until its page is ready
///
/// # Returns
///
/// * `Ok(PageSnapshot)` - The first ready snapshot
/// * `Err(FetchError::SessionExpired)` - A 401 or the sign-in page is showing
/// * `Err(FetchError::NotFound)` - The page answered 404 or 410
/// * `Err(FetchError::AntiBotBlocked)` - Timed out while a challenge was showing
/// * `Err(FetchError::PageNotReady)` - Timed out while the page was loading
pub async fn wait_until_ready(
    driver: &mut dyn BrowserDriver,
    url: &str,
    policy: &ReadinessPolicy,
) -> Result<PageSnapshot, FetchError> {
    let started = Instant::now();

    loop {
        let snapshot = driver.snapshot().await?;
        let final_url = if snapshot.url.is_empty() {
            url
        } else {
            snapshot.url.as_str()
        };
        if let Some(err) = landing_failure(snapshot.status, url, final_url, &snapshot.html) {
            return Err(err);
        }

        let verdict = policy.evaluate(&snapshot);

        if verdict.is_ready() {
            tracing::debug!("{} ready after {:?}", url, started.elapsed());
            return Ok(snapshot);
        }

        let waited = started.elapsed();
        if waited >= policy.timeout() {
            return Err(if verdict.is_challenge() {
                FetchError::AntiBotBlocked {
                    url: url.to_string(),
                }
            } else {
                FetchError::PageNotReady {
                    url: url.to_string(),
                    waited,
                }
            });
        }

        tracing::trace!("{} not ready yet: {:?}", url, verdict);
        tokio::time::sleep(policy.poll_interval()).await;
    }
}
