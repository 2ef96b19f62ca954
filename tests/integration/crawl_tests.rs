//! Integration tests for the crawler
//!
//! These tests use wiremock to stand in for the catalogue site and run the
//! full crawl cycle end-to-end against a temporary progress database.

use async_trait::async_trait;
use reelcrawl::auth::CredentialBroker;
use reelcrawl::config::{parse_config, Config};
use reelcrawl::crawler::{run_crawl, CrawlScheduler, RunOptions, StopFlag};
use reelcrawl::fetch::{
    build_http_client, build_worker_pool, BrowserDriver, BrowserLauncher, BrowserProfile,
    FetchError, FetchMode, HttpFetcher, PageSnapshot, SessionFetcher,
};
use reelcrawl::output::JsonlItemSink;
use reelcrawl::retry::RetryPolicy;
use reelcrawl::state::{ItemStatus, JobStatus, PageStatus};
use reelcrawl::storage::{
    open_store, ClaimPolicy, DiscoveredListing, ItemKey, ItemOutcome, ItemRef, ItemScope,
    ProgressStore, SqliteProgressStore,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOGIN_AUTH: &str = r#"
username = "alice"
password = "secret"
"#;

const MANUAL_AUTH: &str = r#"
manual-session = "session=operator"
"#;

/// Creates a test configuration pointing at the mock server
fn create_test_config(server: &MockServer, dir: &TempDir, auth: &str, max_attempts: u32) -> Config {
    let toml = format!(
        r#"
[site]
base-url = "{uri}"
request-timeout-secs = 5

[auth]
{auth}

[retry]
max-attempts = {max_attempts}
backoff-base-ms = 1
backoff-cap-ms = 10
jitter-percent = 0

[scheduler]
batch-size = 2

[output]
database-path = "{db}"
items-path = "{items}"

[[catalogue]]
task-type = "genre_listing"
relations = [7]
listing-url = "{uri}/genres/{{relation}}?page={{page}}"
listing-mode = "http"
detail-mode = "http"
"#,
        uri = server.uri(),
        auth = auth,
        max_attempts = max_attempts,
        db = dir.path().join("progress.db").display(),
        items = dir.path().join("items.jsonl").display(),
    );
    parse_config(&toml).expect("test config should be valid")
}

fn open_test_store(config: &Config) -> SqliteProgressStore {
    open_store(
        Path::new(&config.output.database_path),
        ClaimPolicy::from_config(config),
    )
    .unwrap()
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/ja"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>welcome</html>"))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ja/ajax/user/signin"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("set-cookie", "session=abc; Path=/"),
        )
        .mount(server)
        .await;
}

async fn mount_listing(server: &MockServer, page: u32, total_pages: u32, codes: &[&str]) {
    let items: Vec<_> = codes
        .iter()
        .map(|code| serde_json::json!({ "code": code, "url": format!("/ja/{}", code) }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/genres/7"))
        .and(query_param("page", page.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "total_pages": total_pages,
            "items": items,
        })))
        .mount(server)
        .await;
}

async fn mount_detail(server: &MockServer, code: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/ja/{}", code)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("<html><body><h1>{}</h1></body></html>", code)),
        )
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, request_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == request_path)
        .count()
}

async fn login_count(server: &MockServer) -> usize {
    requests_to(server, "/ja/ajax/user/signin").await
}

fn item(store: &SqliteProgressStore, code: &str) -> reelcrawl::storage::ItemRecord {
    store.get_item(&ItemKey::new(code, 7)).unwrap().unwrap()
}

#[tokio::test]
async fn test_full_crawl_single_page() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    mount_listing(&server, 1, 1, &["ABC-001", "ABC-002", "ABC-003"]).await;
    for code in ["ABC-001", "ABC-002", "ABC-003"] {
        mount_detail(&server, code).await;
    }

    let config = create_test_config(&server, &dir, LOGIN_AUTH, 3);
    let summary = run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();

    let job = summary.job("genre_listing").unwrap();
    assert_eq!(job.items_success, 3);
    assert_eq!(job.job.status, JobStatus::Completed);
    assert!(!summary.interrupted);

    // One login serves every fetch of the run
    assert_eq!(login_count(&server).await, 1);
    assert_eq!(summary.logins, 1);

    let items = std::fs::read_to_string(&config.output.items_path).unwrap();
    assert_eq!(items.lines().count(), 3);
}

#[tokio::test]
async fn test_exhausted_item_fails_page() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    mount_listing(&server, 1, 1, &["ABC-001", "ABC-002", "ABC-003"]).await;
    mount_detail(&server, "ABC-001").await;
    mount_detail(&server, "ABC-002").await;
    Mock::given(method("GET"))
        .and(path("/ja/ABC-003"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = create_test_config(&server, &dir, LOGIN_AUTH, 2);
    run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();

    let store = open_test_store(&config);
    let job = store.get_job_by_task_type("genre_listing").unwrap().unwrap();
    let pages = store.pages_for_job(job.id).unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].processed_items, 3);
    assert_eq!(pages[0].status, PageStatus::Failed);

    let failed = item(&store, "ABC-003");
    assert_eq!(failed.status, ItemStatus::FailedTerminal);
    assert_eq!(failed.retry_count, 2);
    assert!(failed.last_error.unwrap().starts_with("http_status"));

    assert_eq!(requests_to(&server, "/ja/ABC-003").await, 2);
}

#[tokio::test]
async fn test_manual_session_expiry_is_terminal() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    mount_listing(&server, 1, 1, &["ABC-001"]).await;
    Mock::given(method("GET"))
        .and(path("/ja/ABC-001"))
        .and(header("cookie", "session=operator"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let config = create_test_config(&server, &dir, MANUAL_AUTH, 3);
    let summary = run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();

    assert_eq!(login_count(&server).await, 0);
    assert_eq!(summary.logins, 0);

    let store = open_test_store(&config);
    let expired = item(&store, "ABC-001");
    assert_eq!(expired.status, ItemStatus::FailedTerminal);
    assert!(expired
        .last_error
        .unwrap()
        .contains("manual session expired"));
    assert_eq!(requests_to(&server, "/ja/ABC-001").await, 1);
}

#[tokio::test]
async fn test_discovers_reported_page_count() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    for page in 1..=5u32 {
        let code = format!("P{}-001", page);
        mount_listing(&server, page, 5, &[code.as_str()]).await;
        mount_detail(&server, &code).await;
    }

    let config = create_test_config(&server, &dir, LOGIN_AUTH, 3);
    let summary = run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();

    let store = open_test_store(&config);
    let job = store.get_job_by_task_type("genre_listing").unwrap().unwrap();
    let pages = store.pages_for_job(job.id).unwrap();

    assert_eq!(pages.len(), 5);
    assert!(pages.iter().all(|p| p.status == PageStatus::Completed));
    assert!(pages.iter().all(|p| p.total_pages == 5));
    assert_eq!(summary.items_success(), 5);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    mount_listing(&server, 1, 1, &["ABC-001", "ABC-002"]).await;
    mount_detail(&server, "ABC-001").await;
    mount_detail(&server, "ABC-002").await;

    let config = create_test_config(&server, &dir, LOGIN_AUTH, 3);
    run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();
    let second = run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();

    // The completed job is skipped entirely
    assert_eq!(requests_to(&server, "/ja/ABC-001").await, 1);
    assert_eq!(requests_to(&server, "/genres/7").await, 1);
    assert_eq!(second.items_success(), 2);

    let store = open_test_store(&config);
    let job = store.get_job_by_task_type("genre_listing").unwrap().unwrap();
    let pages = store.pages_for_job(job.id).unwrap();
    assert_eq!(pages[0].processed_items, 2);
    assert_eq!(store.items_for_page(pages[0].id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_rediscover_picks_up_new_items() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/genres/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "total_pages": 1,
            "items": [{"code": "ABC-001", "url": "/ja/ABC-001"}],
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_listing(&server, 1, 1, &["ABC-001", "ABC-002"]).await;
    mount_detail(&server, "ABC-001").await;
    mount_detail(&server, "ABC-002").await;

    let config = create_test_config(&server, &dir, LOGIN_AUTH, 3);
    run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();
    let summary = run_crawl(
        &config,
        "hash",
        RunOptions { rediscover: true },
        StopFlag::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.items_success(), 2);
    assert_eq!(requests_to(&server, "/ja/ABC-001").await, 1);
    assert_eq!(requests_to(&server, "/ja/ABC-002").await, 1);
}

#[tokio::test]
async fn test_resume_skips_finished_items() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    for code in ["ABC-001", "ABC-002", "ABC-003"] {
        mount_detail(&server, code).await;
    }
    let config = create_test_config(&server, &dir, LOGIN_AUTH, 3);

    // State left behind by a run killed after its first item
    {
        let mut store = open_test_store(&config);
        let job = store.upsert_job("genre_listing", "hash").unwrap();
        store
            .update_job_status(job.id, JobStatus::Running, None)
            .unwrap();
        let page = store.upsert_page(job.id, 7, 1).unwrap();
        let listing = DiscoveredListing {
            total_pages: Some(1),
            items: ["ABC-001", "ABC-002", "ABC-003"]
                .iter()
                .map(|code| ItemRef {
                    code: code.to_string(),
                    url: format!("{}/ja/{}", server.uri(), code),
                })
                .collect(),
        };
        store.record_listing(page.id, &listing, None).unwrap();
        store
            .mark_item_result(&ItemKey::new("ABC-001", 7), &ItemOutcome::Success)
            .unwrap();
    }

    run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();

    assert_eq!(requests_to(&server, "/ja/ABC-001").await, 0);
    assert_eq!(requests_to(&server, "/ja/ABC-002").await, 1);
    assert_eq!(requests_to(&server, "/genres/7").await, 0);

    let store = open_test_store(&config);
    let job = store.get_job_by_task_type("genre_listing").unwrap().unwrap();
    let pages = store.pages_for_job(job.id).unwrap();
    assert_eq!(pages[0].processed_items, 3);
    assert_eq!(pages[0].status, PageStatus::Completed);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_rejected_session_refreshes_once() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    mount_listing(&server, 1, 1, &["ABC-001"]).await;
    Mock::given(method("GET"))
        .and(path("/ja/ABC-001"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_detail(&server, "ABC-001").await;

    let config = create_test_config(&server, &dir, LOGIN_AUTH, 3);
    let summary = run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();

    assert_eq!(login_count(&server).await, 2);
    assert_eq!(summary.logins, 2);
    assert_eq!(requests_to(&server, "/ja/ABC-001").await, 2);

    let store = open_test_store(&config);
    let fetched = item(&store, "ABC-001");
    assert_eq!(fetched.status, ItemStatus::Success);
    assert_eq!(fetched.retry_count, 1);
}

#[tokio::test]
async fn test_stopped_run_fetches_nothing() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    mount_listing(&server, 1, 1, &["ABC-001"]).await;

    let config = create_test_config(&server, &dir, LOGIN_AUTH, 3);
    let stop = StopFlag::new();
    stop.stop();

    let summary = run_crawl(&config, "hash", RunOptions::default(), stop)
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    assert_eq!(
        summary.job("genre_listing").unwrap().job.status,
        JobStatus::Pending
    );
}

#[test]
fn test_concurrent_claims_never_overlap() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("progress.db");
    let policy = ClaimPolicy::default();

    let job_id = {
        let mut store = open_store(&db_path, policy).unwrap();
        let job = store.upsert_job("genre_listing", "hash").unwrap();
        let page = store.upsert_page(job.id, 7, 1).unwrap();
        let listing = DiscoveredListing {
            total_pages: Some(1),
            items: (0..40)
                .map(|n| ItemRef {
                    code: format!("ABC-{:03}", n),
                    url: format!("https://catalogue.example/ja/abc-{:03}", n),
                })
                .collect(),
        };
        store.record_listing(page.id, &listing, None).unwrap();
        job.id
    };

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let db_path = db_path.clone();
            std::thread::spawn(move || {
                let mut store = open_store(&db_path, policy).unwrap();
                let mut claimed = Vec::new();
                loop {
                    let batch = store.claim_pending_items(ItemScope::Job(job_id), 3).unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch.into_iter().map(|item| item.code));
                }
                claimed
            })
        })
        .collect();

    let results: Vec<Vec<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let first: HashSet<_> = results[0].iter().collect();
    let second: HashSet<_> = results[1].iter().collect();

    assert!(first.is_disjoint(&second));
    assert_eq!(first.len() + second.len(), 40);
}

#[tokio::test]
async fn test_missing_item_fails_without_retry() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    mount_listing(&server, 1, 1, &["ABC-001", "ABC-002"]).await;
    mount_detail(&server, "ABC-001").await;
    Mock::given(method("GET"))
        .and(path("/ja/ABC-002"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let config = create_test_config(&server, &dir, LOGIN_AUTH, 3);
    let summary = run_crawl(&config, "hash", RunOptions::default(), StopFlag::new())
        .await
        .unwrap();

    // Permanent failures are never retried
    assert_eq!(requests_to(&server, "/ja/ABC-002").await, 1);

    let store = open_test_store(&config);
    let missing = item(&store, "ABC-002");
    assert_eq!(missing.status, ItemStatus::FailedTerminal);
    assert_eq!(missing.retry_count, 1);
    assert!(missing.last_error.unwrap().starts_with("not_found:"));

    let job = store.get_job_by_task_type("genre_listing").unwrap().unwrap();
    let pages = store.pages_for_job(job.id).unwrap();
    assert_eq!(pages[0].processed_items, 2);
    assert_eq!(pages[0].status, PageStatus::Failed);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(summary.items_success(), 1);
    assert_eq!(summary.items_failed_terminal(), 1);
}

/// Shared script of a fake browser: the first `rejections` renders show a 401
#[derive(Default)]
struct BrowserScript {
    rejections: AtomicUsize,
    cookies: Mutex<Vec<String>>,
    launches: AtomicUsize,
}

struct ScriptedDriver {
    script: Arc<BrowserScript>,
    url: String,
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn navigate(&mut self, url: &str) -> Result<(), FetchError> {
        self.url = url.to_string();
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<PageSnapshot, FetchError> {
        let rejected = self
            .script
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        Ok(if rejected {
            PageSnapshot {
                url: self.url.clone(),
                title: "401".to_string(),
                html: "<html><body><h1>401 Unauthorized</h1></body></html>".to_string(),
                status: Some(401),
            }
        } else {
            PageSnapshot {
                url: self.url.clone(),
                title: String::new(),
                html: "<html><body><div class=\"movie-detail\"><h1>ABC-001</h1></div></body></html>"
                    .to_string(),
                status: Some(200),
            }
        })
    }

    async fn set_cookies(&mut self, _base_url: &str, cookie_header: &str) -> Result<(), FetchError> {
        self.script
            .cookies
            .lock()
            .unwrap()
            .push(cookie_header.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), FetchError> {
        Ok(())
    }
}

struct ScriptedLauncher {
    script: Arc<BrowserScript>,
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self, _profile: &BrowserProfile) -> Result<Box<dyn BrowserDriver>, FetchError> {
        self.script.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedDriver {
            script: Arc::clone(&self.script),
            url: String::new(),
        }))
    }
}

#[tokio::test]
async fn test_rendered_rejection_refreshes_session() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_login(&server).await;
    mount_listing(&server, 1, 1, &["ABC-001"]).await;

    let mut config = create_test_config(&server, &dir, LOGIN_AUTH, 3);
    config.catalogue[0].detail_mode = FetchMode::Rendered;
    config.browser.pool_size = 1;
    config.browser.ready_timeout_secs = 1;
    config.browser.poll_interval_ms = 10;
    config.browser.profile_root = dir.path().join("profiles").display().to_string();

    let script = Arc::new(BrowserScript::default());
    script.rejections.store(1, Ordering::SeqCst);
    let pool = build_worker_pool(
        &config.browser,
        Arc::new(ScriptedLauncher {
            script: Arc::clone(&script),
        }),
        &config.site.base_url,
    );

    let client = build_http_client(&config.site).unwrap();
    let broker = CredentialBroker::from_config(
        client.clone(),
        &config.site,
        &config.auth,
        RetryPolicy::new(&config.retry),
        Vec::new(),
    )
    .unwrap();
    let fetcher = Arc::new(SessionFetcher::with_pool(HttpFetcher::new(client), pool));
    let sink = JsonlItemSink::open(Path::new(&config.output.items_path)).unwrap();

    let scheduler = CrawlScheduler::new(
        &config,
        "hash",
        Arc::new(Mutex::new(open_test_store(&config))),
        Arc::new(broker),
        fetcher.clone(),
        Arc::new(sink),
    );
    let summary = scheduler.run().await.unwrap();
    fetcher.shutdown().await;

    // The 401 in the browser triggered exactly one re-login
    assert_eq!(login_count(&server).await, 2);
    assert_eq!(summary.logins, 2);
    assert_eq!(summary.items_success(), 1);

    let store = open_test_store(&config);
    let fetched = item(&store, "ABC-001");
    assert_eq!(fetched.status, ItemStatus::Success);
    assert_eq!(fetched.retry_count, 1);
    assert!(fetched.detail_fetched);

    // Fresh cookies were injected into the same browser after the refresh
    assert_eq!(script.launches.load(Ordering::SeqCst), 1);
    assert_eq!(script.cookies.lock().unwrap().len(), 2);
}
