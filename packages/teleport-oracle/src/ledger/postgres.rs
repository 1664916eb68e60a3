//! Postgres-backed relay ledger
//!
//! `try_begin` is a single `INSERT ... ON CONFLICT DO NOTHING`, so the
//! database unique constraint decides races between gap replay and live
//! delivery of the same event. Losing that race is not an error; it is the
//! `AlreadyHandled` outcome.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, error};

use super::{BeginOutcome, RelayLedger};
use crate::error::LedgerError;
use crate::types::{RelayRecord, RelayStatus, SourceEvent, StatusCounts};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and migrate
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    async fn transition(
        &self,
        event_id: &str,
        status: RelayStatus,
        dest_tx_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"UPDATE relay_records
               SET status = $2, dest_tx_id = $3, error_message = $4, updated_at = NOW()
               WHERE event_id = $1 AND status = 'pending'"#,
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(dest_tx_id)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(event_id, error = ?e, "SQL error updating relay record");
            e
        })?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(event_id).await? {
            None => Err(LedgerError::NotFound(event_id.to_string())),
            Some(record) => Err(LedgerError::InvalidTransition {
                event_id: event_id.to_string(),
                status: record.status.to_string(),
            }),
        }
    }
}

#[async_trait]
impl RelayLedger for PgLedger {
    async fn try_begin(&self, event: &SourceEvent) -> Result<BeginOutcome, LedgerError> {
        // raw_amount is NUMERIC(78,0); bind as text and cast, read back as TEXT
        let record = RelayRecord::pending(event);
        let inserted: Option<(String,)> = sqlx::query_as(
            r#"INSERT INTO relay_records (event_id, block_number, recipient, raw_amount, status)
               VALUES ($1, $2, $3, $4::NUMERIC, 'pending')
               ON CONFLICT (event_id) DO NOTHING
               RETURNING event_id"#,
        )
        .bind(&record.event_id)
        .bind(record.block_number)
        .bind(&record.recipient)
        .bind(&record.raw_amount)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(_) => Ok(BeginOutcome::Proceed),
            None => {
                debug!(event_id = %record.event_id, "Relay record already exists");
                Ok(BeginOutcome::AlreadyHandled)
            }
        }
    }

    async fn mark_issued(&self, event_id: &str, dest_tx_id: &str) -> Result<(), LedgerError> {
        self.transition(event_id, RelayStatus::Issued, Some(dest_tx_id), None)
            .await
    }

    async fn mark_failed(&self, event_id: &str, reason: &str) -> Result<(), LedgerError> {
        self.transition(event_id, RelayStatus::Failed, None, Some(reason))
            .await
    }

    async fn get(&self, event_id: &str) -> Result<Option<RelayRecord>, LedgerError> {
        let record = sqlx::query_as::<_, RelayRecord>(
            r#"SELECT event_id, block_number, recipient, raw_amount::TEXT AS raw_amount, status, dest_tx_id,
                      error_message, created_at, updated_at
               FROM relay_records WHERE event_id = $1"#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn pending_records(&self) -> Result<Vec<RelayRecord>, LedgerError> {
        let records = sqlx::query_as::<_, RelayRecord>(
            r#"SELECT event_id, block_number, recipient, raw_amount::TEXT AS raw_amount, status, dest_tx_id,
                      error_message, created_at, updated_at
               FROM relay_records WHERE status = 'pending'
               ORDER BY block_number, event_id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn status_counts(&self) -> Result<StatusCounts, LedgerError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT status::TEXT, COUNT(*) FROM relay_records GROUP BY status"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "issued" => counts.issued = count,
                "failed" => counts.failed = count,
                other => error!(status = other, "Unknown relay status in database"),
            }
        }
        Ok(counts)
    }

    async fn load_cursor(&self) -> Result<Option<u64>, LedgerError> {
        let row: Option<(i64,)> =
            sqlx::query_as(r#"SELECT last_block FROM relay_cursor WHERE id = 1"#)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0.max(0) as u64))
    }

    async fn save_cursor(&self, block: u64) -> Result<(), LedgerError> {
        sqlx::query(
            r#"INSERT INTO relay_cursor (id, last_block) VALUES (1, $1)
               ON CONFLICT (id) DO UPDATE
               SET last_block = GREATEST(relay_cursor.last_block, EXCLUDED.last_block),
                   updated_at = NOW()"#,
        )
        .bind(block as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
