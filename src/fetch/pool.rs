//! Browser worker pools
//!
//! A [`WorkerPool`] hands rendered fetches to browser workers. The single
//! pool serializes every request through one long-lived browser; the multi
//! pool spreads them over N browsers with separate profiles.

use crate::auth::Session;
use crate::config::{BrowserConfig, PoolMode};
use crate::fetch::browser::{BrowserLauncher, BrowserProfile, BrowserWorker};
use crate::fetch::readiness::ReadinessPolicy;
use crate::fetch::{FetchError, FetchResult};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// Strategy for rendering pages in browsers
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn render(&self, url: &str, session: &Session) -> Result<FetchResult, FetchError>;

    /// Number of renders that may run at once
    fn size(&self) -> usize;

    async fn shutdown(&self);
}

/// One browser; requests wait for each other
pub struct SingleWorkerPool {
    worker: Mutex<BrowserWorker>,
}

impl SingleWorkerPool {
    pub fn new(worker: BrowserWorker) -> Self {
        Self {
            worker: Mutex::new(worker),
        }
    }
}

#[async_trait]
impl WorkerPool for SingleWorkerPool {
    async fn render(&self, url: &str, session: &Session) -> Result<FetchResult, FetchError> {
        self.worker.lock().await.render(url, session).await
    }

    fn size(&self) -> usize {
        1
    }

    async fn shutdown(&self) {
        self.worker.lock().await.shutdown().await;
    }
}

/// N browsers handed out through a semaphore and an idle list
pub struct MultiWorkerPool {
    workers: Vec<Mutex<BrowserWorker>>,
    idle: std::sync::Mutex<Vec<usize>>,
    permits: Semaphore,
}

impl MultiWorkerPool {
    pub fn new(workers: Vec<BrowserWorker>) -> Self {
        let size = workers.len();
        Self {
            workers: workers.into_iter().map(Mutex::new).collect(),
            idle: std::sync::Mutex::new((0..size).rev().collect()),
            permits: Semaphore::new(size),
        }
    }

    fn checkout(&self) -> Result<IdleSlot<'_>, FetchError> {
        let index = self
            .idle
            .lock()
            .map_err(|_| FetchError::Browser("worker pool lock poisoned".to_string()))?
            .pop()
            .ok_or_else(|| FetchError::Browser("no idle browser worker".to_string()))?;
        Ok(IdleSlot {
            idle: &self.idle,
            index,
        })
    }
}

/// A checked-out worker index, returned to the idle list on drop
struct IdleSlot<'a> {
    idle: &'a std::sync::Mutex<Vec<usize>>,
    index: usize,
}

impl Drop for IdleSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(self.index);
        }
    }
}

#[async_trait]
impl WorkerPool for MultiWorkerPool {
    async fn render(&self, url: &str, session: &Session) -> Result<FetchResult, FetchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Browser("worker pool is shut down".to_string()))?;
        let slot = self.checkout()?;

        let mut worker = self.workers[slot.index].lock().await;
        tracing::trace!("{} -> browser '{}'", url, worker.profile().name);
        worker.render(url, session).await
    }

    fn size(&self) -> usize {
        self.workers.len()
    }

    async fn shutdown(&self) {
        self.permits.close();
        for worker in &self.workers {
            worker.lock().await.shutdown().await;
        }
    }
}

/// Builds the pool selected by the browser configuration
///
/// # Arguments
///
/// * `config` - Pool mode, size, profile root and readiness settings
/// * `launcher` - Starts the browsers
/// * `base_url` - Site whose cookies the workers carry
pub fn build_worker_pool(
    config: &BrowserConfig,
    launcher: Arc<dyn BrowserLauncher>,
    base_url: &str,
) -> Arc<dyn WorkerPool> {
    let readiness = Arc::new(ReadinessPolicy::from_config(config));
    let root = Path::new(&config.profile_root);

    match config.mode {
        PoolMode::Single => {
            let profile = BrowserProfile {
                name: "single".to_string(),
                dir: root.join("single"),
                headless: config.headless,
            };
            tracing::info!("Using a single browser worker ({})", profile.dir.display());
            Arc::new(SingleWorkerPool::new(BrowserWorker::new(
                profile, launcher, readiness, base_url,
            )))
        }
        PoolMode::Multi => {
            // Profiles of a previous run are never reused
            let run_token = format!(
                "{}-{}",
                chrono::Utc::now().format("%Y%m%d%H%M%S"),
                std::process::id()
            );
            let workers = (0..config.pool_size.max(1))
                .map(|i| {
                    let name = format!("worker-{}-{}", i, run_token);
                    BrowserWorker::new(
                        BrowserProfile {
                            dir: root.join(&name),
                            name,
                            headless: config.headless,
                        },
                        Arc::clone(&launcher),
                        Arc::clone(&readiness),
                        base_url,
                    )
                })
                .collect();
            tracing::info!("Using {} browser workers", config.pool_size);
            Arc::new(MultiWorkerPool::new(workers))
        }
    }
}
