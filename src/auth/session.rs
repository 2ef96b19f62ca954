//! Sessions and the cookie jar they are built from

use reqwest::header::{HeaderMap, SET_COOKIE};
use std::time::{Duration, Instant};

/// Ordered cookie set
///
/// Setting a cookie that already exists replaces its value in place, so the
/// rendered header keeps the order in which cookies first appeared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `name=value; name=value` header
    pub fn parse_header(header: &str) -> Self {
        let mut jar = Self::new();
        for pair in header.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                jar.insert(name.trim(), value.trim());
            }
        }
        jar
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        if name.is_empty() {
            return;
        }
        match self.cookies.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.cookies.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.cookies.retain(|(n, _)| n != name);
    }

    /// Applies one `Set-Cookie` header value
    ///
    /// Only the leading `name=value` pair matters; attributes are ignored. An
    /// empty value deletes the cookie.
    pub fn apply_set_cookie(&mut self, set_cookie: &str) {
        let pair = set_cookie.split(';').next().unwrap_or_default();
        if let Some((name, value)) = pair.split_once('=') {
            let (name, value) = (name.trim(), value.trim());
            if value.is_empty() {
                self.remove(name);
            } else {
                self.insert(name, value);
            }
        }
    }

    /// Applies every `Set-Cookie` header of a response
    pub fn absorb(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            match value.to_str() {
                Ok(set_cookie) => self.apply_set_cookie(set_cookie),
                Err(_) => tracing::debug!("Skipping non-ASCII Set-Cookie header"),
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether any of the given cookie names is present
    pub fn contains_any(&self, names: &[String]) -> bool {
        names.iter().any(|name| self.get(name).is_some())
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Renders the `Cookie` request header
    pub fn to_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Credentials attached to every request
#[derive(Debug, Clone)]
pub struct Session {
    /// Rendered `Cookie` header
    pub cookie_header: String,
    pub acquired_at: Instant,
    /// Lifetime of the session; `None` never expires
    pub ttl: Option<Duration>,
    /// Incremented by every login; workers re-inject cookies when it changes
    pub generation: u64,
    /// Supplied by the operator rather than obtained by logging in
    pub manual: bool,
}

impl Session {
    pub fn new(jar: &CookieJar, ttl: Duration, generation: u64) -> Self {
        Self {
            cookie_header: jar.to_header(),
            acquired_at: Instant::now(),
            ttl: Some(ttl),
            generation,
            manual: false,
        }
    }

    /// Wraps an operator-supplied cookie header verbatim
    pub fn manual(cookie_header: &str) -> Self {
        Self {
            cookie_header: cookie_header.to_string(),
            acquired_at: Instant::now(),
            ttl: None,
            generation: 0,
            manual: true,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.acquired_at.elapsed() >= ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_and_render_header() {
        let jar = CookieJar::parse_header("locale=ja; session=abc;  x-token=t ;");
        assert_eq!(jar.len(), 3);
        assert_eq!(jar.get("session"), Some("abc"));
        assert_eq!(jar.to_header(), "locale=ja; session=abc; x-token=t");
    }

    #[test]
    fn test_later_value_replaces_in_place() {
        let mut jar = CookieJar::new();
        jar.apply_set_cookie("locale=ja; Path=/");
        jar.apply_set_cookie("session=old; HttpOnly; Secure");
        jar.apply_set_cookie("locale=en; Path=/");

        assert_eq!(jar.to_header(), "locale=en; session=old");
    }

    #[test]
    fn test_empty_value_deletes() {
        let mut jar = CookieJar::parse_header("session=abc; locale=ja");
        jar.apply_set_cookie("session=; Max-Age=0");
        assert_eq!(jar.to_header(), "locale=ja");
    }

    #[test]
    fn test_absorb_response_headers() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("session=abc; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("x-token=t; Path=/"));

        let mut jar = CookieJar::new();
        jar.absorb(&headers);

        assert!(jar.contains_any(&["x-token".to_string()]));
        assert!(!jar.contains_any(&["remember".to_string()]));
        assert_eq!(jar.to_header(), "session=abc; x-token=t");
    }

    #[test]
    fn test_session_expiry() {
        let jar = CookieJar::parse_header("session=abc");
        assert!(Session::new(&jar, Duration::ZERO, 1).is_expired());
        assert!(!Session::new(&jar, Duration::from_secs(3600), 1).is_expired());
        assert!(!Session::manual("session=abc").is_expired());
    }
}
