//! Browser driver seam and the worker that owns one driver
//!
//! Browser automation itself lives outside this crate. An embedder supplies a
//! [`BrowserLauncher`] that starts an async [`BrowserDriver`], or wraps a
//! synchronous [`BlockingDriver`] in a [`BlockingDriverAdapter`].

use crate::auth::Session;
use crate::fetch::readiness::{wait_until_ready, PageSnapshot, ReadinessPolicy};
use crate::fetch::{FetchError, FetchResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Identity and on-disk profile of one browser instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserProfile {
    pub name: String,
    pub dir: PathBuf,
    pub headless: bool,
}

/// An async handle on a running browser
#[async_trait]
pub trait BrowserDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), FetchError>;

    /// Captures what the browser currently shows
    async fn snapshot(&mut self) -> Result<PageSnapshot, FetchError>;

    /// Installs a cookie header for the site at `base_url`
    async fn set_cookies(&mut self, base_url: &str, cookie_header: &str) -> Result<(), FetchError>;

    async fn close(&mut self) -> Result<(), FetchError>;
}

/// Starts browsers
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserDriver>, FetchError>;
}

/// A synchronous browser handle
pub trait BlockingDriver: Send + 'static {
    fn navigate(&mut self, url: &str) -> Result<(), FetchError>;

    fn snapshot(&mut self) -> Result<PageSnapshot, FetchError>;

    fn set_cookies(&mut self, base_url: &str, cookie_header: &str) -> Result<(), FetchError>;

    fn close(&mut self) -> Result<(), FetchError>;
}

/// Runs a [`BlockingDriver`] on the blocking thread pool
pub struct BlockingDriverAdapter<D: BlockingDriver> {
    inner: Arc<Mutex<D>>,
}

impl<D: BlockingDriver> BlockingDriverAdapter<D> {
    pub fn new(driver: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(driver)),
        }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, FetchError>
    where
        T: Send + 'static,
        F: FnOnce(&mut D) -> Result<T, FetchError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut driver = inner
                .lock()
                .map_err(|_| FetchError::Browser("driver lock poisoned".to_string()))?;
            op(&mut driver)
        })
        .await
        .map_err(|e| FetchError::Browser(format!("driver task failed: {}", e)))?
    }
}

#[async_trait]
impl<D: BlockingDriver> BrowserDriver for BlockingDriverAdapter<D> {
    async fn navigate(&mut self, url: &str) -> Result<(), FetchError> {
        let url = url.to_string();
        self.run(move |d| d.navigate(&url)).await
    }

    async fn snapshot(&mut self) -> Result<PageSnapshot, FetchError> {
        self.run(|d| d.snapshot()).await
    }

    async fn set_cookies(&mut self, base_url: &str, cookie_header: &str) -> Result<(), FetchError> {
        let base_url = base_url.to_string();
        let cookie_header = cookie_header.to_string();
        self.run(move |d| d.set_cookies(&base_url, &cookie_header))
            .await
    }

    async fn close(&mut self) -> Result<(), FetchError> {
        self.run(|d| d.close()).await
    }
}

/// One long-lived browser with its own profile
///
/// The driver is launched on first use and relaunched on the next use after
/// it failed. Session cookies are injected again whenever the session
/// generation changes.
pub struct BrowserWorker {
    profile: BrowserProfile,
    launcher: Arc<dyn BrowserLauncher>,
    readiness: Arc<ReadinessPolicy>,
    base_url: String,
    driver: Option<Box<dyn BrowserDriver>>,
    applied_generation: Option<u64>,
}

impl BrowserWorker {
    pub fn new(
        profile: BrowserProfile,
        launcher: Arc<dyn BrowserLauncher>,
        readiness: Arc<ReadinessPolicy>,
        base_url: &str,
    ) -> Self {
        Self {
            profile,
            launcher,
            readiness,
            base_url: base_url.to_string(),
            driver: None,
            applied_generation: None,
        }
    }

    pub fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    /// Loads a URL and waits until it is ready
    ///
    /// Error statuses and landings on the sign-in page map onto the same
    /// errors as a plain HTTP fetch.
    pub async fn render(&mut self, url: &str, session: &Session) -> Result<FetchResult, FetchError> {
        if self.driver.is_none() {
            tracing::info!("Launching browser '{}'", self.profile.name);
            self.driver = Some(self.launcher.launch(&self.profile).await?);
            self.applied_generation = None;
        }

        let result = self.render_with_driver(url, session).await;

        if let Err(FetchError::Browser(e)) = &result {
            tracing::warn!(
                "Browser '{}' failed, relaunching on next use: {}",
                self.profile.name,
                e
            );
            self.discard().await;
        }

        result
    }

    async fn render_with_driver(
        &mut self,
        url: &str,
        session: &Session,
    ) -> Result<FetchResult, FetchError> {
        let driver = self
            .driver
            .as_mut()
            .ok_or_else(|| FetchError::Browser("browser not running".to_string()))?;

        if self.applied_generation != Some(session.generation) {
            driver
                .set_cookies(&self.base_url, &session.cookie_header)
                .await?;
            self.applied_generation = Some(session.generation);
            tracing::debug!(
                "Browser '{}' switched to session generation {}",
                self.profile.name,
                session.generation
            );
        }

        driver.navigate(url).await?;
        let snapshot = wait_until_ready(driver.as_mut(), url, &self.readiness).await?;
        let status = snapshot.status.unwrap_or(200);

        match FetchError::from_status(status, url, false) {
            // A challenge cleared in the browser keeps its navigation status
            Some(FetchError::HttpStatus {
                status: 403 | 503, ..
            })
            | None => {}
            Some(err) => return Err(err),
        }

        Ok(FetchResult {
            status_code: status,
            final_url: if snapshot.url.is_empty() {
                url.to_string()
            } else {
                snapshot.url
            },
            body: snapshot.html,
        })
    }

    async fn discard(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            if let Err(e) = driver.close().await {
                tracing::debug!("Closing browser '{}' failed: {}", self.profile.name, e);
            }
        }
        self.applied_generation = None;
    }

    /// Closes the driver if one is running
    pub async fn shutdown(&mut self) {
        self.discard().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrowserConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        cookies: Mutex<Vec<String>>,
        navigations: AtomicUsize,
        closes: AtomicUsize,
    }

    struct ScriptedBlocking {
        recorder: Arc<Recorder>,
        url: String,
    }

    impl BlockingDriver for ScriptedBlocking {
        fn navigate(&mut self, url: &str) -> Result<(), FetchError> {
            self.recorder.navigations.fetch_add(1, Ordering::SeqCst);
            self.url = url.to_string();
            Ok(())
        }

        fn snapshot(&mut self) -> Result<PageSnapshot, FetchError> {
            Ok(PageSnapshot {
                url: self.url.clone(),
                title: "ABC-001".to_string(),
                html: "<html><body><h1>ABC-001</h1></body></html>".to_string(),
                status: None,
            })
        }

        fn set_cookies(&mut self, _base_url: &str, cookie_header: &str) -> Result<(), FetchError> {
            self.recorder
                .cookies
                .lock()
                .unwrap()
                .push(cookie_header.to_string());
            Ok(())
        }

        fn close(&mut self) -> Result<(), FetchError> {
            self.recorder.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedLauncher {
        recorder: Arc<Recorder>,
        launches: AtomicUsize,
    }

    #[async_trait]
    impl BrowserLauncher for ScriptedLauncher {
        async fn launch(
            &self,
            _profile: &BrowserProfile,
        ) -> Result<Box<dyn BrowserDriver>, FetchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(BlockingDriverAdapter::new(ScriptedBlocking {
                recorder: Arc::clone(&self.recorder),
                url: String::new(),
            })))
        }
    }

    fn session(generation: u64, cookie: &str) -> Session {
        let mut session = Session::manual(cookie);
        session.generation = generation;
        session
    }

    fn worker(launcher: Arc<ScriptedLauncher>) -> BrowserWorker {
        BrowserWorker::new(
            BrowserProfile {
                name: "single".to_string(),
                dir: PathBuf::from("/tmp/profiles/single"),
                headless: true,
            },
            launcher,
            Arc::new(ReadinessPolicy::from_config(&BrowserConfig::default())),
            "https://catalogue.example",
        )
    }

    #[tokio::test]
    async fn test_worker_injects_cookies_per_generation() {
        let recorder = Arc::new(Recorder::default());
        let launcher = Arc::new(ScriptedLauncher {
            recorder: Arc::clone(&recorder),
            launches: AtomicUsize::new(0),
        });
        let mut worker = worker(Arc::clone(&launcher));

        let first = worker
            .render("https://catalogue.example/ja/abc-001", &session(1, "session=a"))
            .await
            .unwrap();
        assert_eq!(first.status_code, 200);
        assert_eq!(first.final_url, "https://catalogue.example/ja/abc-001");

        worker
            .render("https://catalogue.example/ja/abc-002", &session(1, "session=a"))
            .await
            .unwrap();
        worker
            .render("https://catalogue.example/ja/abc-003", &session(2, "session=b"))
            .await
            .unwrap();

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.navigations.load(Ordering::SeqCst), 3);
        assert_eq!(
            *recorder.cookies.lock().unwrap(),
            vec!["session=a".to_string(), "session=b".to_string()]
        );

        worker.shutdown().await;
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }
}
