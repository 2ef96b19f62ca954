use crate::config::types::{
    AuthConfig, BrowserConfig, CatalogueEntry, Config, OutputConfig, PoolMode, RetryConfig,
    SchedulerConfig, SiteConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_site_config(&config.site)?;
    validate_auth_config(&config.auth)?;
    validate_retry_config(&config.retry)?;
    validate_browser_config(&config.browser)?;
    validate_scheduler_config(&config.scheduler)?;
    validate_output_config(&config.output)?;
    validate_catalogue(&config.catalogue)?;
    Ok(())
}

fn validate_site_config(config: &SiteConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base-url: {}", e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "base-url must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates login configuration
///
/// Credentials are only required when no manual session is supplied.
fn validate_auth_config(config: &AuthConfig) -> Result<(), ConfigError> {
    if let Some(manual) = &config.manual_session {
        if !manual.contains('=') {
            return Err(ConfigError::Validation(
                "manual-session must be a cookie header of the form 'name=value; name=value'"
                    .to_string(),
            ));
        }
        return Ok(());
    }

    let has_username = config.username.as_deref().is_some_and(|u| !u.is_empty());
    let has_password = config.password.as_deref().is_some_and(|p| !p.is_empty());
    if !has_username || !has_password {
        return Err(ConfigError::Validation(
            "auth.username and auth.password are required unless manual-session is set"
                .to_string(),
        ));
    }

    for path in [&config.login_page, &config.login_endpoint] {
        if !path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "login paths must start with '/', got '{}'",
                path
            )));
        }
    }

    if config.session_cookies.is_empty() {
        return Err(ConfigError::Validation(
            "session-cookies cannot be empty".to_string(),
        ));
    }

    if config.session_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "session-ttl-secs must be >= 1".to_string(),
        ));
    }

    if config.login_attempts == 0 {
        return Err(ConfigError::Validation(
            "login-attempts must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_attempts < 1 || config.max_attempts > 10 {
        return Err(ConfigError::Validation(format!(
            "max-attempts must be between 1 and 10, got {}",
            config.max_attempts
        )));
    }

    if config.backoff_base_ms > config.backoff_cap_ms {
        return Err(ConfigError::Validation(format!(
            "backoff-base-ms ({}) cannot exceed backoff-cap-ms ({})",
            config.backoff_base_ms, config.backoff_cap_ms
        )));
    }

    if config.jitter_percent > 100 {
        return Err(ConfigError::Validation(format!(
            "jitter-percent must be <= 100, got {}",
            config.jitter_percent
        )));
    }

    if config.anti_bot_backoff_factor < 1 {
        return Err(ConfigError::Validation(
            "anti-bot-backoff-factor must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_browser_config(config: &BrowserConfig) -> Result<(), ConfigError> {
    if config.pool_size < 1 || config.pool_size > 16 {
        return Err(ConfigError::Validation(format!(
            "pool-size must be between 1 and 16, got {}",
            config.pool_size
        )));
    }

    if config.mode == PoolMode::Single && config.pool_size != 1 {
        return Err(ConfigError::Validation(format!(
            "single browser mode requires pool-size = 1, got {}",
            config.pool_size
        )));
    }

    if config.profile_root.is_empty() {
        return Err(ConfigError::Validation(
            "profile-root cannot be empty".to_string(),
        ));
    }

    if config.ready_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "ready-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.poll_interval_ms < 50 {
        return Err(ConfigError::Validation(format!(
            "poll-interval-ms must be >= 50ms, got {}ms",
            config.poll_interval_ms
        )));
    }

    if let Some(markers) = &config.content_markers {
        for marker in markers {
            if scraper::Selector::parse(marker).is_err() {
                return Err(ConfigError::Validation(format!(
                    "content marker '{}' is not a valid CSS selector",
                    marker
                )));
            }
        }
    }

    Ok(())
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.batch_size < 1 || config.batch_size > 50 {
        return Err(ConfigError::Validation(format!(
            "batch-size must be between 1 and 50, got {}",
            config.batch_size
        )));
    }

    if config.stale_after_secs < 1 {
        return Err(ConfigError::Validation(
            "stale-after-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if config.items_path.is_empty() {
        return Err(ConfigError::Validation(
            "items-path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates catalogue entries
fn validate_catalogue(entries: &[CatalogueEntry]) -> Result<(), ConfigError> {
    if entries.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[catalogue]] entry is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for entry in entries {
        if entry.task_type.is_empty() {
            return Err(ConfigError::Validation(
                "catalogue task-type cannot be empty".to_string(),
            ));
        }

        if !seen.insert(entry.task_type.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate catalogue task-type '{}'",
                entry.task_type
            )));
        }

        if entry.relations.is_empty() {
            return Err(ConfigError::Validation(format!(
                "catalogue '{}' must list at least one relation",
                entry.task_type
            )));
        }

        if !entry.listing_url.contains("{page}") {
            return Err(ConfigError::Validation(format!(
                "listing-url for '{}' must contain a {{page}} placeholder",
                entry.task_type
            )));
        }

        let probe = entry
            .listing_url
            .replace("{relation}", "0")
            .replace("{page}", "1");
        Url::parse(&probe).map_err(|e| {
            ConfigError::InvalidUrl(format!(
                "Invalid listing-url for '{}': {}",
                entry.task_type, e
            ))
        })?;

        if entry.max_pages == Some(0) {
            return Err(ConfigError::Validation(format!(
                "max-pages for '{}' must be >= 1",
                entry.task_type
            )));
        }
    }

    Ok(())
}
