//! Credential broker
//!
//! One broker is shared by every worker of a run. It logs in lazily, reuses
//! the session until its TTL runs out, and makes sure that many workers
//! hitting the same expired session trigger a single re-login.

use crate::auth::{AuthError, Authenticator, FallbackAuthenticator, HttpAuthenticator, Session};
use crate::config::{AuthConfig, SiteConfig};
use crate::retry::RetryPolicy;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Where sessions come from
enum SessionSource {
    Login(Box<dyn Authenticator>),
    /// Operator-supplied cookies; never refreshed
    Manual(Session),
}

/// Caches the session shared by a crawl run
pub struct CredentialBroker {
    source: SessionSource,
    session_cookies: Vec<String>,
    ttl: Duration,
    cache: Mutex<Option<Session>>,
    generation: AtomicU64,
    logins: AtomicU64,
}

impl CredentialBroker {
    /// Creates a broker that logs in through `authenticator`
    ///
    /// # Arguments
    ///
    /// * `authenticator` - The login method
    /// * `session_cookies` - Cookie names proving a login succeeded
    /// * `ttl` - How long a session is reused
    pub fn new(
        authenticator: Box<dyn Authenticator>,
        session_cookies: Vec<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            source: SessionSource::Login(authenticator),
            session_cookies,
            ttl,
            cache: Mutex::new(None),
            generation: AtomicU64::new(0),
            logins: AtomicU64::new(0),
        }
    }

    /// Creates a broker that always hands out the given cookie header
    pub fn manual(cookie_header: &str) -> Self {
        Self {
            source: SessionSource::Manual(Session::manual(cookie_header)),
            session_cookies: Vec::new(),
            ttl: Duration::MAX,
            cache: Mutex::new(None),
            generation: AtomicU64::new(0),
            logins: AtomicU64::new(0),
        }
    }

    /// Builds the broker described by the auth configuration
    ///
    /// A `manual-session` disables login entirely. Otherwise the HTTP login
    /// flow is used, with `fallbacks` tried in order when it fails.
    pub fn from_config(
        client: Client,
        site: &SiteConfig,
        auth: &AuthConfig,
        backoff: RetryPolicy,
        fallbacks: Vec<Box<dyn Authenticator>>,
    ) -> Result<Self, AuthError> {
        if let Some(cookie_header) = &auth.manual_session {
            tracing::info!("Using manual session; automatic login disabled");
            return Ok(Self::manual(cookie_header));
        }

        let primary = HttpAuthenticator::new(client, site, auth, backoff)?;
        let authenticator: Box<dyn Authenticator> = if fallbacks.is_empty() {
            Box::new(primary)
        } else {
            Box::new(
                fallbacks
                    .into_iter()
                    .fold(FallbackAuthenticator::new(Box::new(primary)), |chain, f| {
                        chain.with_fallback(f)
                    }),
            )
        };

        Ok(Self::new(
            authenticator,
            auth.session_cookies.clone(),
            Duration::from_secs(auth.session_ttl_secs),
        ))
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.source, SessionSource::Manual(_))
    }

    /// Number of logins performed so far
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    /// Returns the cached session, logging in when needed
    ///
    /// # Arguments
    ///
    /// * `force_refresh` - Log in even if the cached session is still fresh
    ///
    /// # Returns
    ///
    /// * `Ok(Session)` - A usable session
    /// * `Err(AuthError::Authentication)` - Login failed or produced no session cookie
    pub async fn get_session(&self, force_refresh: bool) -> Result<Session, AuthError> {
        let authenticator = match &self.source {
            SessionSource::Manual(session) => return Ok(session.clone()),
            SessionSource::Login(authenticator) => authenticator,
        };

        // Held across the login so concurrent callers wait for one login
        let mut cache = self.cache.lock().await;

        if !force_refresh {
            if let Some(session) = cache.as_ref().filter(|s| !s.is_expired()) {
                return Ok(session.clone());
            }
        }

        tracing::info!("Logging in via '{}'", authenticator.name());
        let jar = authenticator.login().await?;
        self.logins.fetch_add(1, Ordering::SeqCst);

        if !jar.contains_any(&self.session_cookies) {
            return Err(AuthError::Authentication(format!(
                "login returned no session cookie (expected one of: {})",
                self.session_cookies.join(", ")
            )));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Session::new(&jar, self.ttl, generation);
        tracing::info!(
            "Acquired session generation {} ({} cookies)",
            generation,
            jar.len()
        );

        *cache = Some(session.clone());
        Ok(session)
    }

    /// Drops the cached session
    ///
    /// # Returns
    ///
    /// * `Err(AuthError::ManualSessionExpired)` - Manual sessions cannot be refreshed
    pub async fn invalidate(&self) -> Result<(), AuthError> {
        if self.is_manual() {
            return Err(AuthError::ManualSessionExpired);
        }
        self.cache.lock().await.take();
        Ok(())
    }

    /// Drops the cached session only if it is the one the caller used
    ///
    /// # Returns
    ///
    /// True if the cache was cleared, false if a newer session is already cached
    pub async fn invalidate_if_current(&self, used: &Session) -> Result<bool, AuthError> {
        if self.is_manual() {
            return Err(AuthError::ManualSessionExpired);
        }

        let mut cache = self.cache.lock().await;
        match cache.as_ref() {
            Some(current) if current.generation == used.generation => {
                tracing::debug!("Invalidating session generation {}", used.generation);
                cache.take();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CookieJar;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingAuthenticator {
        calls: Arc<AtomicUsize>,
        cookie: &'static str,
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        fn name(&self) -> &str {
            "counting"
        }

        async fn login(&self) -> Result<CookieJar, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(CookieJar::parse_header(&format!("{}{}", self.cookie, n)))
        }
    }

    fn broker(ttl: Duration) -> (CredentialBroker, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = CredentialBroker::new(
            Box::new(CountingAuthenticator {
                calls: Arc::clone(&calls),
                cookie: "session=s",
            }),
            vec!["session".to_string(), "x-token".to_string()],
            ttl,
        );
        (broker, calls)
    }

    #[tokio::test]
    async fn test_session_reused_within_ttl() {
        let (broker, calls) = broker(Duration::from_secs(3600));

        let first = broker.get_session(false).await.unwrap();
        let second = broker.get_session(false).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.generation, second.generation);
        assert_eq!(first.cookie_header, "session=s1");
        assert_eq!(broker.login_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let (broker, calls) = broker(Duration::from_secs(3600));

        let (a, b, c) = tokio::join!(
            broker.get_session(false),
            broker.get_session(false),
            broker.get_session(false)
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().generation, b.unwrap().generation);
        assert_eq!(c.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_expired_session_triggers_login() {
        let (broker, calls) = broker(Duration::ZERO);

        broker.get_session(false).await.unwrap();
        let second = broker.get_session(false).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.generation, 2);
    }

    #[tokio::test]
    async fn test_force_refresh() {
        let (broker, calls) = broker(Duration::from_secs(3600));

        broker.get_session(false).await.unwrap();
        let refreshed = broker.get_session(true).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed.cookie_header, "session=s2");
    }

    #[tokio::test]
    async fn test_invalidate_if_current_only_once() {
        let (broker, calls) = broker(Duration::from_secs(3600));
        let stale = broker.get_session(false).await.unwrap();

        assert!(broker.invalidate_if_current(&stale).await.unwrap());
        let fresh = broker.get_session(false).await.unwrap();

        // A second worker reporting the same stale session changes nothing
        assert!(!broker.invalidate_if_current(&stale).await.unwrap());
        let again = broker.get_session(false).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fresh.generation, again.generation);
    }

    #[tokio::test]
    async fn test_missing_session_cookie_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = CredentialBroker::new(
            Box::new(CountingAuthenticator {
                calls,
                cookie: "locale=ja",
            }),
            vec!["session".to_string()],
            Duration::from_secs(3600),
        );

        let err = broker.get_session(false).await.unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_manual_mode() {
        let broker = CredentialBroker::manual("session=operator; x-token=t");

        let session = broker.get_session(true).await.unwrap();
        assert_eq!(session.cookie_header, "session=operator; x-token=t");
        assert!(session.manual);
        assert!(broker.is_manual());

        assert!(matches!(
            broker.invalidate().await,
            Err(AuthError::ManualSessionExpired)
        ));
        assert!(matches!(
            broker.invalidate_if_current(&session).await,
            Err(AuthError::ManualSessionExpired)
        ));
        assert_eq!(broker.login_count(), 0);
    }

    #[test]
    fn test_from_config_prefers_manual_session() {
        let site = SiteConfig {
            base_url: "https://catalogue.example".to_string(),
            user_agent: "ua".to_string(),
            request_timeout_secs: 5,
        };
        let auth = AuthConfig {
            manual_session: Some("session=abc".to_string()),
            ..AuthConfig::default()
        };

        let broker = CredentialBroker::from_config(
            Client::new(),
            &site,
            &auth,
            RetryPolicy::new(&crate::config::RetryConfig::default()),
            Vec::new(),
        )
        .unwrap();
        assert!(broker.is_manual());
    }
}
