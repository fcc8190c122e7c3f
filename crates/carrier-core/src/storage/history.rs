//! Repository for the append-only history table.
//!
//! Terminal entries (Processed, Failed, Removed) live here. Rows are
//! never updated after insert, which makes retry-chain auditing a plain
//! query: each attempt is its own archived row linked by correlation
//! tokens.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use super::{EntrySearch, ENTRY_COLUMNS};
use crate::{
    error::Result,
    models::{ProcessingState, QueueEntry, RecordId},
};

/// Repository for archived queue entries.
pub struct Repository {
    pool: Arc<PgPool>,
    table: String,
}

impl Repository {
    /// Creates a new repository over the given history table.
    pub fn new(pool: Arc<PgPool>, table: String) -> Self {
        Self { pool, table }
    }

    /// Archives an entry within a transaction, preserving its live record
    /// id and stamping the terminal state.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &QueueEntry,
        terminal_state: ProcessingState,
    ) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (
                record_id, queue_name, creating_owner, processing_owner,
                processing_state, processing_claimed_date, event_type,
                event_payload, user_token, future_user_token, search_key1,
                search_key2, effective_date, error_count, created_date
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            )
            "#,
            table = self.table
        ))
        .bind(entry.record_id)
        .bind(&entry.queue_name)
        .bind(&entry.creating_owner)
        .bind(&entry.processing_owner)
        .bind(terminal_state.to_string())
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
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Read-only filtered query over archived entries.
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

    /// Finds an archived entry by its original record id.
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

    /// The configured history table name.
    pub fn table_name(&self) -> &str {
        &self.table
    }
}
