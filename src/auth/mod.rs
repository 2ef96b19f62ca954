//! Authentication module for session acquisition and caching
//!
//! This module handles everything needed to talk to the catalogue as a
//! logged-in user:
//! - Cookie jars and the sessions built from them
//! - The HTTP login flow and fallback chains of login methods
//! - A credential broker that caches one session for the whole run

mod broker;
mod login;
mod session;

pub use broker::CredentialBroker;
pub use login::{FallbackAuthenticator, HttpAuthenticator};
pub use session::{CookieJar, Session};

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised while acquiring or invalidating a session
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("{0}")]
    Authentication(String),

    #[error("manual session expired; supply a fresh cookie header")]
    ManualSessionExpired,
}

/// A way of logging in
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Runs the login flow and returns the cookies it produced
    async fn login(&self) -> Result<CookieJar, AuthError>;
}
