//! Login flows
//!
//! The HTTP flow visits the login page to collect its cookies, then posts the
//! credentials to the JSON sign-in endpoint and keeps whatever cookies the
//! response sets.

use crate::auth::{AuthError, Authenticator, CookieJar};
use crate::config::{AuthConfig, SiteConfig};
use crate::fetch::readiness::is_strong_interstitial;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::Client;
use serde_json::json;

/// Why a single login round trip failed
enum LoginFailure {
    /// Worth another round trip
    Transient(String),
    /// Another round trip would fail the same way
    Fatal(AuthError),
}

/// Logs in through the site's own sign-in API
pub struct HttpAuthenticator {
    client: Client,
    base_url: String,
    login_page: String,
    login_endpoint: String,
    username: String,
    password: String,
    attempts: u32,
    backoff: RetryPolicy,
}

impl HttpAuthenticator {
    /// Creates an authenticator from configuration
    ///
    /// # Arguments
    ///
    /// * `client` - HTTP client; it must not keep its own cookie store
    /// * `site` - Site whose base URL prefixes the login paths
    /// * `auth` - Credentials, login paths and attempt budget
    /// * `backoff` - Delays between failed round trips
    ///
    /// # Returns
    ///
    /// * `Err(AuthError::Authentication)` - Username or password missing
    pub fn new(
        client: Client,
        site: &SiteConfig,
        auth: &AuthConfig,
        backoff: RetryPolicy,
    ) -> Result<Self, AuthError> {
        let (username, password) = match (&auth.username, &auth.password) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => {
                return Err(AuthError::Authentication(
                    "username and password are required for login".to_string(),
                ))
            }
        };

        Ok(Self {
            client,
            base_url: site.base_url.trim_end_matches('/').to_string(),
            login_page: auth.login_page.clone(),
            login_endpoint: auth.login_endpoint.clone(),
            username,
            password,
            attempts: auth.login_attempts.max(1),
            backoff,
        })
    }

    async fn attempt(&self) -> Result<CookieJar, LoginFailure> {
        let mut jar = CookieJar::new();

        let landing_url = format!("{}{}", self.base_url, self.login_page);
        let landing = self
            .client
            .get(&landing_url)
            .send()
            .await
            .map_err(|e| LoginFailure::Transient(format!("login page: {}", e)))?;

        let status = landing.status();
        if status.is_server_error() {
            return Err(LoginFailure::Transient(format!(
                "login page returned {}",
                status
            )));
        }
        jar.absorb(landing.headers());

        let body = landing
            .text()
            .await
            .map_err(|e| LoginFailure::Transient(format!("login page: {}", e)))?;
        if is_strong_interstitial(&body) {
            return Err(LoginFailure::Fatal(AuthError::Authentication(
                "login page is behind an anti-bot interstitial".to_string(),
            )));
        }

        let endpoint = format!("{}{}", self.base_url, self.login_endpoint);
        let mut request = self
            .client
            .post(&endpoint)
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&json!({
                "username": self.username,
                "password": self.password,
                "remember_me": 1,
            }));
        if !jar.is_empty() {
            request = request.header(COOKIE, jar.to_header());
        }

        let response = request
            .send()
            .await
            .map_err(|e| LoginFailure::Transient(format!("sign-in: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LoginFailure::Transient(format!(
                "sign-in returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(LoginFailure::Fatal(AuthError::Authentication(format!(
                "sign-in rejected with status {}",
                status
            ))));
        }

        jar.absorb(response.headers());
        Ok(jar)
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    fn name(&self) -> &str {
        "http"
    }

    async fn login(&self) -> Result<CookieJar, AuthError> {
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.attempt().await {
                Ok(jar) => return Ok(jar),
                Err(LoginFailure::Fatal(e)) => return Err(e),
                Err(LoginFailure::Transient(e)) => {
                    tracing::warn!("Login attempt {}/{} failed: {}", attempt, self.attempts, e);
                    last_error = e;
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff.next_delay(attempt)).await;
                    }
                }
            }
        }

        Err(AuthError::Authentication(format!(
            "login unreachable after {} attempts: {}",
            self.attempts, last_error
        )))
    }
}

/// Tries a chain of login methods in order
pub struct FallbackAuthenticator {
    chain: Vec<Box<dyn Authenticator>>,
}

impl FallbackAuthenticator {
    pub fn new(primary: Box<dyn Authenticator>) -> Self {
        Self {
            chain: vec![primary],
        }
    }

    /// Appends a method tried after every earlier one failed
    pub fn with_fallback(mut self, fallback: Box<dyn Authenticator>) -> Self {
        self.chain.push(fallback);
        self
    }
}

#[async_trait]
impl Authenticator for FallbackAuthenticator {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn login(&self) -> Result<CookieJar, AuthError> {
        let mut failures = Vec::new();

        for authenticator in &self.chain {
            match authenticator.login().await {
                Ok(jar) => return Ok(jar),
                Err(e) => {
                    tracing::warn!("Login via '{}' failed: {}", authenticator.name(), e);
                    failures.push(format!("{}: {}", authenticator.name(), e));
                }
            }
        }

        Err(AuthError::Authentication(failures.join("; ")))
    }
}
