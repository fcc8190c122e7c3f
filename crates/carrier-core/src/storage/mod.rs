//! Database access layer for the live and history queue tables.
//!
//! The repository layer translates between the `QueueEntry` domain model
//! and the configured physical tables. All SQL lives here; the engine
//! crate never issues queries directly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub mod history;
pub mod queue_entries;

use crate::{
    error::Result,
    models::{ProcessingState, QueueEntry, QueueName, RecordId},
};

/// Filter for read-only entry queries.
///
/// Unset fields match everything. Used by the operator/test query API
/// over both the live and history tables.
#[derive(Debug, Clone)]
pub struct EntrySearch {
    /// Restrict to a single logical queue.
    pub queue_name: Option<QueueName>,
    /// Restrict to a single processing state.
    pub state: Option<ProcessingState>,
    /// Restrict to entries with this search key 1.
    pub search_key1: Option<i64>,
    /// Restrict to entries with this search key 2.
    pub search_key2: Option<i64>,
    /// Restrict to entries effective at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of rows returned.
    pub limit: i64,
}

impl Default for EntrySearch {
    fn default() -> Self {
        Self {
            queue_name: None,
            state: None,
            search_key1: None,
            search_key2: None,
            since: None,
            limit: 100,
        }
    }
}

/// Container for the queue repositories sharing one connection pool.
///
/// One `Storage` serves one configured queue: a live table holding
/// claimable entries and an append-only history table holding terminal
/// ones.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the live (claimable) table.
    pub queue_entries: Arc<queue_entries::Repository>,

    /// Repository for the append-only history table.
    pub history: Arc<history::Repository>,
}

impl Storage {
    /// Creates a storage instance over the given pool and table names.
    pub fn new(pool: PgPool, table_name: &str, history_table_name: &str) -> Self {
        let pool = Arc::new(pool);

        Self {
            queue_entries: Arc::new(queue_entries::Repository::new(
                pool.clone(),
                table_name.to_string(),
            )),
            history: Arc::new(history::Repository::new(pool, history_table_name.to_string())),
        }
    }

    /// Archives an entry: inserts it into the history table with the given
    /// terminal state and deletes it from the live table, in one unit of
    /// work.
    ///
    /// Idempotent when the live row is already gone: a retried completion
    /// (or a double-submitted reap) finds no row to delete and archives
    /// nothing a second time.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails or `terminal_state` is not
    /// terminal.
    pub async fn move_to_history(
        &self,
        record_id: RecordId,
        terminal_state: ProcessingState,
    ) -> Result<bool> {
        if !terminal_state.is_terminal() {
            return Err(crate::error::CoreError::InvalidInput(format!(
                "cannot archive entry {record_id} with non-terminal state {terminal_state}"
            )));
        }

        let mut tx = self.queue_entries.pool().begin().await?;

        let Some(entry) = self.queue_entries.delete_in_tx(&mut tx, record_id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };

        self.history.insert_in_tx(&mut tx, &entry, terminal_state).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Cancels an Available entry, archiving it as Removed.
    ///
    /// Returns false when the entry is missing or no longer Available (it
    /// may have been claimed in the meantime).
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn remove_available(&self, record_id: RecordId) -> Result<bool> {
        let mut tx = self.queue_entries.pool().begin().await?;

        let Some(entry) =
            self.queue_entries.delete_available_in_tx(&mut tx, record_id).await?
        else {
            tx.rollback().await?;
            return Ok(false);
        };

        self.history.insert_in_tx(&mut tx, &entry, ProcessingState::Removed).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Verifies database connectivity with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) =
            sqlx::query_as("SELECT 1").fetch_one(&*self.queue_entries.pool()).await?;

        Ok(())
    }
}

/// Shared column list used by every SELECT/RETURNING clause.
pub(crate) const ENTRY_COLUMNS: &str = "record_id, queue_name, creating_owner, \
     processing_owner, processing_state, processing_claimed_date, event_type, \
     event_payload, user_token, future_user_token, search_key1, search_key2, \
     effective_date, error_count, created_date";
