//! Plain HTTP fetching
//!
//! This module handles requests that need no browser:
//! - Building the shared HTTP client from site settings
//! - Sending the session cookie header
//! - Mapping response statuses onto fetch errors
//! - Rejecting anti-bot interstitials served with a success status

use crate::auth::Session;
use crate::config::SiteConfig;
use crate::fetch::readiness::is_strong_interstitial;
use crate::fetch::{is_login_page, FetchError, FetchResult};
use reqwest::header::{COOKIE, WWW_AUTHENTICATE};
use reqwest::{redirect::Policy, Client};
use std::time::Duration;

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `site` - The target site configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(site: &SiteConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(site.user_agent.as_str())
        .timeout(Duration::from_secs(site.request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetches pages with a plain GET
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetches a URL with the session's cookies
    ///
    /// # Status Mapping
    ///
    /// | Condition | Error |
    /// |-----------|-------|
    /// | 401, or 403 with `WWW-Authenticate` | SessionExpired |
    /// | 403/503 with an interstitial body | AntiBotBlocked |
    /// | 404, 410 | NotFound |
    /// | any other non-2xx | HttpStatus |
    /// | 2xx with an interstitial body | AntiBotBlocked |
    /// | 2xx landing on the sign-in page | SessionExpired |
    /// | connection or timeout failure | Transport |
    pub async fn get(&self, url: &str, session: &Session) -> Result<FetchResult, FetchError> {
        let mut request = self.client.get(url);
        if !session.cookie_header.is_empty() {
            request = request.header(COOKIE, session.cookie_header.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let auth_challenge = response.headers().contains_key(WWW_AUTHENTICATE);

        if let Some(err) = FetchError::from_status(status, url, auth_challenge) {
            if matches!(err, FetchError::HttpStatus { status: 403 | 503, .. }) {
                let body = response.text().await.unwrap_or_default();
                if is_strong_interstitial(&body) {
                    return Err(FetchError::AntiBotBlocked { url: final_url });
                }
            }
            return Err(err);
        }

        let body = response.text().await?;
        if is_strong_interstitial(&body) {
            return Err(FetchError::AntiBotBlocked { url: final_url });
        }
        if is_login_page(&final_url, &body) {
            return Err(FetchError::SessionExpired { status });
        }

        Ok(FetchResult {
            status_code: status,
            body,
            final_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn site(base_url: &str) -> SiteConfig {
        SiteConfig {
            base_url: base_url.to_string(),
            user_agent: "reelcrawl-test/1.0".to_string(),
            request_timeout_secs: 5,
        }
    }

    async fn fetcher(server: &MockServer) -> HttpFetcher {
        HttpFetcher::new(build_http_client(&site(&server.uri())).unwrap())
    }

    #[test]
    fn test_build_http_client() {
        assert!(build_http_client(&site("https://catalogue.example")).is_ok());
    }

    #[tokio::test]
    async fn test_sends_cookie_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ja/abc-001"))
            .and(header("cookie", "session=abc; x-token=t"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>ABC-001</h1>"))
            .mount(&server)
            .await;

        let result = fetcher(&server)
            .await
            .get(
                &format!("{}/ja/abc-001", server.uri()),
                &Session::manual("session=abc; x-token=t"),
            )
            .await
            .unwrap();

        assert_eq!(result.status_code, 200);
        assert_eq!(result.body, "<h1>ABC-001</h1>");
    }

    #[tokio::test]
    async fn test_unauthorized_is_session_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .await
            .get(&server.uri(), &Session::manual("session=old"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::SessionExpired { status: 401 }));
    }

    #[tokio::test]
    async fn test_interstitial_body_is_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                "<html><head><title>Just a moment...</title></head><body></body></html>",
            ))
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .await
            .get(&server.uri(), &Session::manual("session=abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::AntiBotBlocked { .. }));
    }

    #[tokio::test]
    async fn test_redirect_to_login_is_session_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ja/abc-001"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "/ja/login?next=abc-001"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ja/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>Sign in</h1>"))
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .await
            .get(
                &format!("{}/ja/abc-001", server.uri()),
                &Session::manual("session=old"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::SessionExpired { status: 200 }));
    }

    #[tokio::test]
    async fn test_gone_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .await
            .get(&server.uri(), &Session::manual("session=abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound { status: 410, .. }));
    }
}
