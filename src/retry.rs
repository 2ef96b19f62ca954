//! Retry decisions and backoff
//!
//! Every failed fetch goes through [`RetryPolicy::decide`], which either gives
//! up, asks for a fresh session, or schedules another attempt after an
//! exponential, jittered delay.

use crate::config::RetryConfig;
use crate::fetch::FetchError;
use rand::Rng;
use std::time::Duration;

/// Exponent ceiling so the shift never overflows
const MAX_EXPONENT: u32 = 20;

/// Whether another attempt could succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// What the caller should do after a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then try again
    RetryAfter(Duration),
    /// Invalidate the session, acquire a new one and try again
    RefreshSession,
    /// Record a terminal failure
    GiveUp,
}

/// Failures already seen for one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptHistory {
    pub session_refreshed: bool,
    pub parse_failures: u32,
}

impl AttemptHistory {
    /// Seeds the history from a persisted `last_error`
    ///
    /// A unit whose previous run ended in a parse failure gives up on the next
    /// one, even across a restart.
    pub fn from_last_error(last_error: Option<&str>) -> Self {
        let parse_tag = format!("{}:", FetchError::ParseFailure(String::new()).kind());
        Self {
            session_refreshed: false,
            parse_failures: match last_error {
                Some(e) if e.starts_with(&parse_tag) => 1,
                _ => 0,
            },
        }
    }

    fn record(&mut self, err: &FetchError) {
        if matches!(err, FetchError::ParseFailure(_)) {
            self.parse_failures += 1;
        }
    }
}

/// Retry policy shared by every unit of a run
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
    jitter_percent: u32,
    anti_bot_factor: u32,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
            jitter_percent: config.jitter_percent,
            anti_bot_factor: config.anti_bot_backoff_factor.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classifies a failure given what the unit already went through
    pub fn classify(&self, err: &FetchError, history: &AttemptHistory) -> ErrorClass {
        match err {
            FetchError::NotFound { .. } | FetchError::Unsupported(_) => ErrorClass::Permanent,
            FetchError::ParseFailure(_) if history.parse_failures > 0 => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        }
    }

    /// Capped exponential delay without jitter
    ///
    /// `attempt` is 1-based: the delay after the first failure is the base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let base_ms = self.base.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.cap)
    }

    /// Delay before the next attempt, with random jitter
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let capped = self.backoff(attempt).as_millis() as u64;
        let spread = capped * u64::from(self.jitter_percent) / 100;

        if spread == 0 {
            return Duration::from_millis(capped);
        }

        let jittered = capped - spread.min(capped) + rand::thread_rng().gen_range(0..=spread * 2);
        Duration::from_millis(jittered)
    }

    /// Delay after a specific failure; interstitials back off wider
    pub fn delay_for(&self, err: &FetchError, attempt: u32) -> Duration {
        let delay = self.next_delay(attempt);
        match err {
            FetchError::AntiBotBlocked { .. } => delay * self.anti_bot_factor,
            _ => delay,
        }
    }

    /// Decides what happens after a failed attempt
    ///
    /// # Arguments
    ///
    /// * `err` - The failure of the attempt that just ran
    /// * `attempts_used` - Attempts made so far, including this one
    /// * `history` - Failures already seen for this unit; updated in place
    pub fn decide(
        &self,
        err: &FetchError,
        attempts_used: u32,
        history: &mut AttemptHistory,
    ) -> RetryDecision {
        let class = self.classify(err, history);
        history.record(err);

        if class == ErrorClass::Permanent || attempts_used >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        if matches!(err, FetchError::SessionExpired { .. }) && !history.session_refreshed {
            history.session_refreshed = true;
            return RetryDecision::RefreshSession;
        }

        RetryDecision::RetryAfter(self.delay_for(err, attempts_used))
    }
}
