//! Repository for the live queue table.
//!
//! Implements the atomic claim primitive the whole design rests on:
//! `FOR UPDATE SKIP LOCKED` selection inside a transaction followed by a
//! conditional state/owner update. Claim races resolve as zero affected
//! rows, never as errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::{EntrySearch, ENTRY_COLUMNS};
use crate::{
    error::Result,
    models::{QueueEntry, QueueName, RecordId},
};

/// Repository for live queue entry operations.
///
/// The physical table name is configured per queue; several logical
/// queues may share one table, partitioned by `queue_name`.
pub struct Repository {
    pool: Arc<PgPool>,
    table: String,
}

impl Repository {
    /// Creates a new repository over the given table.
    pub fn new(pool: Arc<PgPool>, table: String) -> Self {
        Self { pool, table }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Appends a new Available entry and returns its assigned record id.
    ///
    /// The entry's own `record_id` is ignored; ordering is established by
    /// the BIGSERIAL column at insert time.
    ///
    /// # Errors
    ///
    /// Constraint violations are fatal for this entry; transient database
    /// errors may be retried by the caller.
    pub async fn insert(&self, entry: &QueueEntry) -> Result<RecordId> {
        let id: i64 = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {table} (
                queue_name, creating_owner, processing_owner, processing_state,
                processing_claimed_date, event_type, event_payload, user_token,
                future_user_token, search_key1, search_key2, effective_date,
                error_count, created_date
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            )
            RETURNING record_id
            "#,
            table = self.table
        ))
        .bind(&entry.queue_name)
        .bind(&entry.creating_owner)
        .bind(&entry.processing_owner)
        .bind(entry.processing_state.to_string())
        .bind(entry.processing_claimed_date)
        .bind(&entry.event_type)
        .bind(&entry.event_payload)
        .bind(entry.user_token)
        .bind(entry.future_user_token)
        .bind(entry.search_key1)
        .bind(entry.search_key2)
        .bind(entry.effective_date)
        .bind(entry.error_count)
        .bind(entry.created_date)
        .fetch_one(&*self.pool)
        .await?;

        Ok(RecordId(id))
    }

    /// Claims up to `limit` ready entries of `queue_name` for `owner`.
    ///
    /// Selects Available rows of the logical queue whose effective date
    /// has passed, oldest record id first, using `FOR UPDATE SKIP
    /// LOCKED` so concurrent claimants never block on or double-claim
    /// the same rows, then stamps them InProcessing with the owner and
    /// claim time. Other logical queues sharing the table are never
    /// touched.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_ready(
        &self,
        queue_name: &QueueName,
        owner: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        let mut tx = self.pool.begin().await?;

        let record_ids: Vec<i64> = sqlx::query_scalar(&format!(
            r#"
            SELECT record_id FROM {table}
            WHERE queue_name = $1
              AND processing_state = 'available'
              AND effective_date <= $2
            ORDER BY record_id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
            table = self.table
        ))
        .bind(queue_name)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if record_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut entries = sqlx::query_as::<_, QueueEntry>(&format!(
            r#"
            UPDATE {table}
            SET processing_state = 'in_processing',
                processing_owner = $1,
                processing_claimed_date = $2
            WHERE record_id = ANY($3)
            RETURNING {columns}
            "#,
            table = self.table,
            columns = ENTRY_COLUMNS
        ))
        .bind(owner)
        .bind(now)
        .bind(&record_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // UPDATE .. RETURNING row order is unspecified; delivery order is
        // record id ascending.
        entries.sort_by_key(|e| e.record_id);

        Ok(entries)
    }

    /// Claims specific record ids for `owner`, skipping any that are no
    /// longer Available.
    ///
    /// Used by the sticky in-flight path: buffered ids are only hints,
    /// the conditional update here remains the source of truth. A losing
    /// claimant simply gets fewer rows back.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn claim_specific(
        &self,
        queue_name: &QueueName,
        owner: &str,
        record_ids: &[RecordId],
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        if record_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = record_ids.iter().map(|id| id.0).collect();

        let mut entries = sqlx::query_as::<_, QueueEntry>(&format!(
            r#"
            UPDATE {table}
            SET processing_state = 'in_processing',
                processing_owner = $1,
                processing_claimed_date = $2
            WHERE record_id = ANY($3)
              AND queue_name = $4
              AND processing_state = 'available'
              AND effective_date <= $2
            RETURNING {columns}
            "#,
            table = self.table,
            columns = ENTRY_COLUMNS
        ))
        .bind(owner)
        .bind(now)
        .bind(&ids)
        .bind(queue_name)
        .fetch_all(&*self.pool)
        .await?;

        entries.sort_by_key(|e| e.record_id);

        Ok(entries)
    }

    /// Returns claimed entries to the Available pool.
    ///
    /// Only affects rows this owner still holds; used when a claimed
    /// batch cannot be dispatched (shutdown drain, poison payload).
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release(&self, owner: &str, record_ids: &[RecordId]) -> Result<u64> {
        if record_ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = record_ids.iter().map(|id| id.0).collect();

        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET processing_state = 'available',
                processing_owner = NULL,
                processing_claimed_date = NULL
            WHERE record_id = ANY($1)
              AND processing_owner = $2
              AND processing_state = 'in_processing'
            "#,
            table = self.table
        ))
        .bind(&ids)
        .bind(owner)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Resets stale claims of `queue_name` back to Available.
    ///
    /// Bulk conditional update for the reaper: only rows still
    /// InProcessing with a claim stamp older than `cutoff` are touched,
    /// so a worker finishing just before the sweep is unaffected. Scoped
    /// to one logical queue because each queue sweeps with its own
    /// period.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reap_stale(&self, queue_name: &QueueName, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET processing_state = 'available',
                processing_owner = NULL,
                processing_claimed_date = NULL
            WHERE queue_name = $1
              AND processing_state = 'in_processing'
              AND processing_claimed_date < $2
            "#,
            table = self.table
        ))
        .bind(queue_name)
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Counts Available rows of `queue_name`; the sticky buffer
    /// watermarks use this as the real backlog size.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_available(&self, queue_name: &QueueName) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(&format!(
            r#"
            SELECT COUNT(*) FROM {table}
            WHERE queue_name = $1 AND processing_state = 'available'
            "#,
            table = self.table
        ))
        .bind(queue_name)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }

    /// Read-only filtered query over live entries; does not affect state.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn search(&self, filter: &EntrySearch) -> Result<Vec<QueueEntry>> {
        let entries = sqlx::query_as::<_, QueueEntry>(&format!(
            r#"
            SELECT {columns} FROM {table}
            WHERE ($1::text IS NULL OR queue_name = $1)
              AND ($2::text IS NULL OR processing_state = $2)
              AND ($3::bigint IS NULL OR search_key1 = $3)
              AND ($4::bigint IS NULL OR search_key2 = $4)
              AND ($5::timestamptz IS NULL OR effective_date >= $5)
            ORDER BY record_id ASC
            LIMIT $6
            "#,
            table = self.table,
            columns = ENTRY_COLUMNS
        ))
        .bind(filter.queue_name.clone())
        .bind(filter.state.map(|s| s.to_string()))
        .bind(filter.search_key1)
        .bind(filter.search_key2)
        .bind(filter.since)
        .bind(filter.limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }

    /// Finds a live entry by record id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_record_id(&self, record_id: RecordId) -> Result<Option<QueueEntry>> {
        let entry = sqlx::query_as::<_, QueueEntry>(&format!(
            "SELECT {columns} FROM {table} WHERE record_id = $1",
            table = self.table,
            columns = ENTRY_COLUMNS
        ))
        .bind(record_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Deletes an entry within a transaction, returning the deleted row.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record_id: RecordId,
    ) -> Result<Option<QueueEntry>> {
        let entry = sqlx::query_as::<_, QueueEntry>(&format!(
            "DELETE FROM {table} WHERE record_id = $1 RETURNING {columns}",
            table = self.table,
            columns = ENTRY_COLUMNS
        ))
        .bind(record_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(entry)
    }

    /// Deletes an entry within a transaction only if it is still
    /// Available; returns the deleted row.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_available_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record_id: RecordId,
    ) -> Result<Option<QueueEntry>> {
        let entry = sqlx::query_as::<_, QueueEntry>(&format!(
            r#"
            DELETE FROM {table}
            WHERE record_id = $1 AND processing_state = 'available'
            RETURNING {columns}
            "#,
            table = self.table,
            columns = ENTRY_COLUMNS
        ))
        .bind(record_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(entry)
    }

    /// The configured table name.
    pub fn table_name(&self) -> &str {
        &self.table
    }
}
