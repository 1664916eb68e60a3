//! Retry and backoff utilities
//!
//! Shared by the dispatcher (transient destination failures) and the
//! subscriber (reconnect attempts).

use std::time::Duration;
use tracing::{debug, warn};

use crate::error::DispatchError;

/// Retry policy with exponential backoff and a ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Reconnect policy for the source subscription
    pub fn reconnect_default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Action to take after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Retry after a backoff period
    RetryAfter(Duration),
    /// Give up; the failure is final
    GiveUp,
}

/// Retry state for one unit of work
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub config: RetryConfig,
    pub attempt: u32,
    pub last_error: Option<DispatchError>,
}

impl RetryContext {
    pub fn with_config(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_error: None,
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, error: DispatchError) {
        self.attempt += 1;
        self.last_error = Some(error);
    }

    /// Get the decision for the next attempt
    pub fn next_action(&self) -> RetryAction {
        match &self.last_error {
            Some(DispatchError::Permanent(reason)) => {
                warn!(error = %reason, "Permanent error - not retrying");
                RetryAction::GiveUp
            }
            Some(DispatchError::Transient(reason)) => {
                if !self.config.should_retry(self.attempt) {
                    return RetryAction::GiveUp;
                }
                // attempt is 1 after the first failure; first wait is initial_backoff
                let backoff = self.config.backoff_for_attempt(self.attempt - 1);
                debug!(
                    ?backoff,
                    attempt = self.attempt,
                    error = %reason,
                    "Transient error - retrying"
                );
                RetryAction::RetryAfter(backoff)
            }
            None => RetryAction::RetryAfter(Duration::ZERO),
        }
    }
}
