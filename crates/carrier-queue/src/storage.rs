//! Storage abstraction layer for the queue engine.
//!
//! Provides trait-based abstractions over storage operations to enable
//! testability without database dependencies. Production implementations
//! use the concrete `carrier_core::storage::Storage`; tests run against
//! the in-memory implementation in [`mem`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use carrier_core::{
    error::Result,
    models::{ProcessingState, QueueEntry, QueueName, RecordId},
    storage::EntrySearch,
};

/// Storage operations required by the queue engine.
///
/// All state transitions happen behind this trait as conditional updates;
/// callers learn whether they won a race from the returned row counts,
/// never from errors. The same contract is honored by the Postgres
/// implementation and the in-memory one, so engine behavior tested
/// against [`mem::MemoryQueueStorage`] holds in production.
pub trait QueueStorage: Send + Sync + 'static {
    /// Appends a new Available entry, returning its assigned record id.
    fn insert(
        &self,
        entry: QueueEntry,
    ) -> Pin<Box<dyn Future<Output = Result<RecordId>> + Send + '_>>;

    /// Atomically claims up to `limit` ready entries of `queue_name` for
    /// `owner`, oldest record id first.
    ///
    /// Entries of other logical queues sharing the store are invisible
    /// here. Concurrent claimants never receive the same entry; a
    /// claimant losing every row gets an empty batch, not an error.
    fn claim_ready(
        &self,
        queue_name: QueueName,
        owner: String,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>>;

    /// Claims specific record ids of `queue_name` for `owner`, skipping
    /// any that are not ready. Used by the sticky in-flight path.
    fn claim_specific(
        &self,
        queue_name: QueueName,
        owner: String,
        record_ids: Vec<RecordId>,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>>;

    /// Returns claimed entries still held by `owner` to the Available
    /// pool. Returns the number of rows actually released.
    fn release(
        &self,
        owner: String,
        record_ids: Vec<RecordId>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Archives an entry with a terminal state, deleting it from the live
    /// table. Returns false when the live row is already gone.
    fn move_to_history(
        &self,
        record_id: RecordId,
        terminal_state: ProcessingState,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Cancels an Available entry, archiving it as Removed. Returns false
    /// when the entry is missing or already claimed.
    fn remove_available(
        &self,
        record_id: RecordId,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Resets InProcessing entries of `queue_name` claimed before
    /// `cutoff` back to Available. Returns the number of entries
    /// reclaimed.
    fn reap_stale(
        &self,
        queue_name: QueueName,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Counts Available entries of `queue_name`.
    fn count_available(
        &self,
        queue_name: QueueName,
    ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>>;

    /// Read-only filtered query over live entries.
    fn search_live(
        &self,
        filter: EntrySearch,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>>;

    /// Read-only filtered query over archived entries.
    fn search_history(
        &self,
        filter: EntrySearch,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>>;

    /// Finds a live entry by record id.
    fn find_live(
        &self,
        record_id: RecordId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueueEntry>>> + Send + '_>>;

    /// Finds an archived entry by its original record id.
    fn find_history(
        &self,
        record_id: RecordId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueueEntry>>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
///
/// Wraps the concrete `carrier_core::storage::Storage`. All database
/// operations go through the repository layer.
pub struct PostgresQueueStorage {
    storage: Arc<carrier_core::storage::Storage>,
}

impl PostgresQueueStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<carrier_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl QueueStorage for PostgresQueueStorage {
    fn insert(
        &self,
        entry: QueueEntry,
    ) -> Pin<Box<dyn Future<Output = Result<RecordId>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_entries.insert(&entry).await })
    }

    fn claim_ready(
        &self,
        queue_name: QueueName,
        owner: String,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.queue_entries.claim_ready(&queue_name, &owner, now, limit).await
        })
    }

    fn claim_specific(
        &self,
        queue_name: QueueName,
        owner: String,
        record_ids: Vec<RecordId>,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.queue_entries.claim_specific(&queue_name, &owner, &record_ids, now).await
        })
    }

    fn release(
        &self,
        owner: String,
        record_ids: Vec<RecordId>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_entries.release(&owner, &record_ids).await })
    }

    fn move_to_history(
        &self,
        record_id: RecordId,
        terminal_state: ProcessingState,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.move_to_history(record_id, terminal_state).await })
    }

    fn remove_available(
        &self,
        record_id: RecordId,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.remove_available(record_id).await })
    }

    fn reap_stale(
        &self,
        queue_name: QueueName,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_entries.reap_stale(&queue_name, cutoff).await })
    }

    fn count_available(
        &self,
        queue_name: QueueName,
    ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_entries.count_available(&queue_name).await })
    }

    fn search_live(
        &self,
        filter: EntrySearch,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_entries.search(&filter).await })
    }

    fn search_history(
        &self,
        filter: EntrySearch,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.history.search(&filter).await })
    }

    fn find_live(
        &self,
        record_id: RecordId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueueEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_entries.find_by_record_id(record_id).await })
    }

    fn find_history(
        &self,
        record_id: RecordId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueueEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.history.find_by_record_id(record_id).await })
    }
}

pub mod mem {
    //! In-memory storage implementation for testing.
    //!
    //! Honors the same claim contract as the Postgres repositories: every
    //! state transition is a conditional check-and-set under one lock, so
    //! concurrent claimants resolve exactly like `FOR UPDATE SKIP LOCKED`
    //! in production. Supports injecting claim failures.

    use std::{
        collections::BTreeMap,
        future::Future,
        pin::Pin,
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use carrier_core::{
        error::{CoreError, Result},
        models::{ProcessingState, QueueEntry, QueueName, RecordId},
        storage::EntrySearch,
    };
    use tokio::sync::RwLock;

    use super::QueueStorage;

    #[derive(Debug, Default)]
    struct Tables {
        next_record_id: i64,
        live: BTreeMap<i64, QueueEntry>,
        history: Vec<QueueEntry>,
    }

    /// In-memory queue storage for testing engine logic without a
    /// database.
    pub struct MemoryQueueStorage {
        tables: Arc<RwLock<Tables>>,
        claim_error: Arc<RwLock<Option<String>>>,
    }

    impl MemoryQueueStorage {
        /// Creates a new storage with empty tables.
        pub fn new() -> Self {
            Self {
                tables: Arc::new(RwLock::new(Tables { next_record_id: 1, ..Tables::default() })),
                claim_error: Arc::new(RwLock::new(None)),
            }
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: String) {
            *self.claim_error.write().await = Some(error);
        }

        /// Returns all live entries in record id order, for verification.
        pub async fn live_entries(&self) -> Vec<QueueEntry> {
            self.tables.read().await.live.values().cloned().collect()
        }

        /// Returns all archived entries in archive order, for
        /// verification.
        pub async fn history_entries(&self) -> Vec<QueueEntry> {
            self.tables.read().await.history.clone()
        }

        /// Verifies a live entry is in the expected state.
        pub async fn verify_live_state(
            &self,
            record_id: RecordId,
            expected: ProcessingState,
        ) -> bool {
            self.tables
                .read()
                .await
                .live
                .get(&record_id.0)
                .is_some_and(|e| e.processing_state == expected)
        }

        fn matches(entry: &QueueEntry, filter: &EntrySearch) -> bool {
            filter.queue_name.as_ref().is_none_or(|q| entry.queue_name == *q)
                && filter.state.is_none_or(|s| entry.processing_state == s)
                && filter.search_key1.is_none_or(|k| entry.search_key1 == k)
                && filter.search_key2.is_none_or(|k| entry.search_key2 == k)
                && filter.since.is_none_or(|t| entry.effective_date >= t)
        }
    }

    impl Default for MemoryQueueStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl QueueStorage for MemoryQueueStorage {
        fn insert(
            &self,
            entry: QueueEntry,
        ) -> Pin<Box<dyn Future<Output = Result<RecordId>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                let mut tables = tables.write().await;
                let id = tables.next_record_id;
                tables.next_record_id += 1;

                let mut entry = entry;
                entry.record_id = RecordId(id);
                tables.live.insert(id, entry);

                Ok(RecordId(id))
            })
        }

        fn claim_ready(
            &self,
            queue_name: QueueName,
            owner: String,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>> {
            let tables = self.tables.clone();
            let claim_error = self.claim_error.clone();
            Box::pin(async move {
                if let Some(error) = claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut tables = tables.write().await;
                let ready: Vec<i64> = tables
                    .live
                    .values()
                    .filter(|e| e.queue_name == queue_name && e.is_ready(now))
                    .take(limit)
                    .map(|e| e.record_id.0)
                    .collect();

                let mut claimed = Vec::with_capacity(ready.len());
                for id in ready {
                    if let Some(entry) = tables.live.get_mut(&id) {
                        entry.processing_state = ProcessingState::InProcessing;
                        entry.processing_owner = Some(owner.clone());
                        entry.processing_claimed_date = Some(now);
                        claimed.push(entry.clone());
                    }
                }

                Ok(claimed)
            })
        }

        fn claim_specific(
            &self,
            queue_name: QueueName,
            owner: String,
            record_ids: Vec<RecordId>,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                let mut tables = tables.write().await;
                let mut claimed = Vec::new();
                for id in record_ids {
                    if let Some(entry) = tables.live.get_mut(&id.0) {
                        if entry.queue_name == queue_name && entry.is_ready(now) {
                            entry.processing_state = ProcessingState::InProcessing;
                            entry.processing_owner = Some(owner.clone());
                            entry.processing_claimed_date = Some(now);
                            claimed.push(entry.clone());
                        }
                    }
                }
                claimed.sort_by_key(|e| e.record_id);
                Ok(claimed)
            })
        }

        fn release(
            &self,
            owner: String,
            record_ids: Vec<RecordId>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                let mut tables = tables.write().await;
                let mut released = 0;
                for id in record_ids {
                    if let Some(entry) = tables.live.get_mut(&id.0) {
                        if entry.processing_state == ProcessingState::InProcessing
                            && entry.processing_owner.as_deref() == Some(owner.as_str())
                        {
                            entry.processing_state = ProcessingState::Available;
                            entry.processing_owner = None;
                            entry.processing_claimed_date = None;
                            released += 1;
                        }
                    }
                }
                Ok(released)
            })
        }

        fn move_to_history(
            &self,
            record_id: RecordId,
            terminal_state: ProcessingState,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                if !terminal_state.is_terminal() {
                    return Err(CoreError::InvalidInput(format!(
                        "cannot archive entry {record_id} with non-terminal state {terminal_state}"
                    )));
                }

                let mut tables = tables.write().await;
                match tables.live.remove(&record_id.0) {
                    Some(mut entry) => {
                        entry.processing_state = terminal_state;
                        tables.history.push(entry);
                        Ok(true)
                    },
                    None => Ok(false),
                }
            })
        }

        fn remove_available(
            &self,
            record_id: RecordId,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                let mut tables = tables.write().await;

                let available = tables
                    .live
                    .get(&record_id.0)
                    .is_some_and(|e| e.processing_state == ProcessingState::Available);
                if !available {
                    return Ok(false);
                }

                if let Some(mut entry) = tables.live.remove(&record_id.0) {
                    entry.processing_state = ProcessingState::Removed;
                    tables.history.push(entry);
                }
                Ok(true)
            })
        }

        fn reap_stale(
            &self,
            queue_name: QueueName,
            cutoff: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                let mut tables = tables.write().await;
                let mut reclaimed = 0;
                for entry in tables.live.values_mut() {
                    if entry.queue_name == queue_name
                        && entry.processing_state == ProcessingState::InProcessing
                        && entry.processing_claimed_date.is_some_and(|t| t < cutoff)
                    {
                        entry.processing_state = ProcessingState::Available;
                        entry.processing_owner = None;
                        entry.processing_claimed_date = None;
                        reclaimed += 1;
                    }
                }
                Ok(reclaimed)
            })
        }

        fn count_available(
            &self,
            queue_name: QueueName,
        ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                let tables = tables.read().await;
                let count = tables
                    .live
                    .values()
                    .filter(|e| {
                        e.queue_name == queue_name
                            && e.processing_state == ProcessingState::Available
                    })
                    .count();
                Ok(i64::try_from(count).unwrap_or(i64::MAX))
            })
        }

        fn search_live(
            &self,
            filter: EntrySearch,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                let tables = tables.read().await;
                let limit = usize::try_from(filter.limit).unwrap_or(usize::MAX);
                Ok(tables
                    .live
                    .values()
                    .filter(|e| Self::matches(e, &filter))
                    .take(limit)
                    .cloned()
                    .collect())
            })
        }

        fn search_history(
            &self,
            filter: EntrySearch,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueEntry>>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                let tables = tables.read().await;
                let limit = usize::try_from(filter.limit).unwrap_or(usize::MAX);
                let mut entries: Vec<QueueEntry> = tables
                    .history
                    .iter()
                    .filter(|e| Self::matches(e, &filter))
                    .cloned()
                    .collect();
                entries.sort_by_key(|e| e.record_id);
                entries.truncate(limit);
                Ok(entries)
            })
        }

        fn find_live(
            &self,
            record_id: RecordId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<QueueEntry>>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move { Ok(tables.read().await.live.get(&record_id.0).cloned()) })
        }

        fn find_history(
            &self,
            record_id: RecordId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<QueueEntry>>> + Send + '_>> {
            let tables = self.tables.clone();
            Box::pin(async move {
                Ok(tables
                    .read()
                    .await
                    .history
                    .iter()
                    .find(|e| e.record_id == record_id)
                    .cloned())
            })
        }
    }

}
