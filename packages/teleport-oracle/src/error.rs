//! Error taxonomy for the relay pipeline
//!
//! Only [`ConfigError`] and an exhausted [`SubscriptionError`] are
//! process-fatal. Everything else terminates a single event in FAILED
//! (or SKIPPED) and is reported to the alert channel.

use thiserror::Error;

/// Pre-flight configuration failure naming the first bad field
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid configuration field `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }

    pub fn missing(field: &'static str) -> Self {
        Self::new(field, "value is required")
    }
}

/// Source chain transport failures
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// Could not open the subscription or query the chain
    #[error("source transport error: {0}")]
    Transport(String),

    /// A delivered log could not be decoded into a source event
    #[error("failed to decode source event: {0}")]
    Decode(String),

    /// Bounded reconnect budget spent
    #[error("re-subscription failed {attempts} consecutive times, last error: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
}

/// Raw amount or multiplier that cannot be converted
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid amount `{value}`: {reason}")]
pub struct InvalidAmountError {
    pub value: String,
    pub reason: String,
}

impl InvalidAmountError {
    pub fn new(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Destination chain dispatch failures, split by retry policy
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Network timeout, node unavailable, resource limits; retried with backoff
    #[error("transient dispatch error: {0}")]
    Transient(String),

    /// Authorization failure, malformed account, rejected action; never retried
    #[error("permanent dispatch error: {0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }
}

/// Relay ledger storage failures
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("no relay record for event {0}")]
    NotFound(String),

    /// Status transition attempted from a non-pending record
    #[error("relay record {event_id} is {status}, expected pending")]
    InvalidTransition { event_id: String, status: String },
}
