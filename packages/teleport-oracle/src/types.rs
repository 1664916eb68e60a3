//! Common types for the relay pipeline
//!
//! Source events as observed on the EVM chain and the relay records the
//! ledger keeps for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Unique position of an event on the source chain
///
/// The ledger key is `<tx_hash>:<log_index>`; ordering follows the chain
/// (block number, then log index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: String,
}

impl EventId {
    pub fn new(block_number: u64, log_index: u64, tx_hash: impl Into<String>) -> Self {
        Self {
            block_number,
            log_index,
            tx_hash: tx_hash.into(),
        }
    }

    /// Ledger primary key
    pub fn key(&self) -> String {
        format!("{}:{}", self.tx_hash, self.log_index)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.block_number, self.log_index, &self.tx_hash).cmp(&(
            other.block_number,
            other.log_index,
            &other.tx_hash,
        ))
    }
}

/// One observed teleport emission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub id: EventId,
    /// Raw token amount in source-chain precision, decimal string of a uint256
    pub amount: String,
    /// Free-text note supplied by the sender; names the destination account
    pub note: String,
}

impl SourceEvent {
    /// Destination account named by the sender
    pub fn recipient(&self) -> &str {
        self.note.trim()
    }
}

/// Processing status of a relay record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Pending,
    Issued,
    Failed,
}

impl RelayStatus {
    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStatus::Pending => "pending",
            RelayStatus::Issued => "issued",
            RelayStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row per processed source event. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RelayRecord {
    pub event_id: String,
    pub block_number: i64,
    pub recipient: String,
    pub raw_amount: String,
    pub status: RelayStatus,
    pub dest_tx_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RelayRecord {
    /// Fresh pending record for an event seen for the first time
    pub fn pending(event: &SourceEvent) -> Self {
        let now = Utc::now();
        Self {
            event_id: event.id.key(),
            block_number: event.id.block_number as i64,
            recipient: event.recipient().to_string(),
            raw_amount: event.amount.clone(),
            status: RelayStatus::Pending,
            dest_tx_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Record counts by status, for the status endpoint and startup report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub issued: i64,
    pub failed: i64,
}
