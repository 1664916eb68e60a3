//! Relay ledger: the idempotency guard
//!
//! Every source event passes through [`RelayLedger::try_begin`] before any
//! destination transaction is built. The first caller for an event id
//! inserts a PENDING record and gets [`BeginOutcome::Proceed`]; every later
//! caller (replay, duplicate live delivery, restart) gets
//! [`BeginOutcome::AlreadyHandled`] and must not dispatch.

use async_trait::async_trait;

use crate::error::LedgerError;
use crate::types::{RelayRecord, SourceEvent, StatusCounts};

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// Result of the atomic check-and-insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Record created as PENDING; the caller owns the dispatch
    Proceed,
    /// A record already exists; the caller must not dispatch
    AlreadyHandled,
}

/// Persistent record of which source events produced destination transfers
#[async_trait]
pub trait RelayLedger: Send + Sync {
    /// Atomically insert a PENDING record if none exists for the event
    async fn try_begin(&self, event: &SourceEvent) -> Result<BeginOutcome, LedgerError>;

    /// PENDING -> ISSUED with the destination transaction id
    async fn mark_issued(&self, event_id: &str, dest_tx_id: &str) -> Result<(), LedgerError>;

    /// PENDING -> FAILED with the failure reason
    async fn mark_failed(&self, event_id: &str, reason: &str) -> Result<(), LedgerError>;

    async fn get(&self, event_id: &str) -> Result<Option<RelayRecord>, LedgerError>;

    /// Records still PENDING (oldest first)
    async fn pending_records(&self) -> Result<Vec<RelayRecord>, LedgerError>;

    async fn status_counts(&self) -> Result<StatusCounts, LedgerError>;

    /// Highest source block whose events have all passed `try_begin`
    async fn load_cursor(&self) -> Result<Option<u64>, LedgerError>;

    /// Advance the cursor; never moves it backwards
    async fn save_cursor(&self, block: u64) -> Result<(), LedgerError>;
}
