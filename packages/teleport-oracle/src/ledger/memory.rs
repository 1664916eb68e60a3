//! In-process ledger with the same semantics as the Postgres ledger.
//! State is lost on restart; used by tests and local dry runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{BeginOutcome, RelayLedger};
use crate::error::LedgerError;
use crate::types::{RelayRecord, RelayStatus, SourceEvent, StatusCounts};

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, RelayRecord>,
    cursor: Option<u64>,
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records, ordered by block then key
    pub fn records(&self) -> Vec<RelayRecord> {
        let state = self.lock();
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by(|a, b| {
            (a.block_number, &a.event_id).cmp(&(b.block_number, &b.event_id))
        });
        records
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-update
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(
        &self,
        event_id: &str,
        apply: impl FnOnce(&mut RelayRecord),
    ) -> Result<(), LedgerError> {
        let mut state = self.lock();
        let record = state
            .records
            .get_mut(event_id)
            .ok_or_else(|| LedgerError::NotFound(event_id.to_string()))?;
        if record.status != RelayStatus::Pending {
            return Err(LedgerError::InvalidTransition {
                event_id: event_id.to_string(),
                status: record.status.to_string(),
            });
        }
        apply(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl RelayLedger for MemoryLedger {
    async fn try_begin(&self, event: &SourceEvent) -> Result<BeginOutcome, LedgerError> {
        let mut state = self.lock();
        let key = event.id.key();
        if state.records.contains_key(&key) {
            return Ok(BeginOutcome::AlreadyHandled);
        }
        state.records.insert(key, RelayRecord::pending(event));
        Ok(BeginOutcome::Proceed)
    }

    async fn mark_issued(&self, event_id: &str, dest_tx_id: &str) -> Result<(), LedgerError> {
        self.transition(event_id, |record| {
            record.status = RelayStatus::Issued;
            record.dest_tx_id = Some(dest_tx_id.to_string());
        })
    }

    async fn mark_failed(&self, event_id: &str, reason: &str) -> Result<(), LedgerError> {
        self.transition(event_id, |record| {
            record.status = RelayStatus::Failed;
            record.error_message = Some(reason.to_string());
        })
    }

    async fn get(&self, event_id: &str) -> Result<Option<RelayRecord>, LedgerError> {
        Ok(self.lock().records.get(event_id).cloned())
    }

    async fn pending_records(&self) -> Result<Vec<RelayRecord>, LedgerError> {
        Ok(self
            .records()
            .into_iter()
            .filter(|r| r.status == RelayStatus::Pending)
            .collect())
    }

    async fn status_counts(&self) -> Result<StatusCounts, LedgerError> {
        let state = self.lock();
        let mut counts = StatusCounts::default();
        for record in state.records.values() {
            match record.status {
                RelayStatus::Pending => counts.pending += 1,
                RelayStatus::Issued => counts.issued += 1,
                RelayStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn load_cursor(&self) -> Result<Option<u64>, LedgerError> {
        Ok(self.lock().cursor)
    }

    async fn save_cursor(&self, block: u64) -> Result<(), LedgerError> {
        let mut state = self.lock();
        state.cursor = Some(state.cursor.map_or(block, |c| c.max(block)));
        Ok(())
    }
}
