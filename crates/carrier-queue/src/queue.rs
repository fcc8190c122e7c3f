//! The notification queue facade.
//!
//! Ties the accessor, dispatcher, and reaper together behind one handle:
//! producers post events (immediate or future-dated), the poll loop
//! discovers ready entries and feeds the workers, and operators query
//! live and archived entries through the search API.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use carrier_core::{storage::EntrySearch, Clock, ProcessingState, QueueEntry, QueueName, RecordId};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    accessor::{QueueAccessor, QueueStatsSnapshot},
    config::{PersistentQueueMode, QueueConfig},
    dispatcher::Dispatcher,
    error::{QueueError, Result},
    handler::{QueueEvent, QueueHandler},
    reaper::Reaper,
    storage::QueueStorage,
};

/// A durable notification queue instance.
///
/// One instance per logical queue per process. Entries posted here
/// survive restarts; exactly one instance processes each entry, whichever
/// wins the claim.
pub struct NotificationQueue {
    queue_name: QueueName,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn QueueStorage>,
    accessor: Arc<QueueAccessor>,
    dispatcher: Arc<Dispatcher>,
    reaper: Arc<Reaper>,
    wakeup: Arc<Notify>,
    processing_off: Arc<AtomicBool>,
    poll_cancellation: CancellationToken,
    poll_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NotificationQueue {
    /// Creates a queue over the given storage and handler.
    ///
    /// `owner` identifies this process on claims and created entries;
    /// it must be stable for the lifetime of the instance but unique
    /// across instances (typically hostname plus a token).
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Configuration` for an invalid configuration.
    pub fn new(
        queue_name: QueueName,
        storage: Arc<dyn QueueStorage>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn QueueHandler>,
        owner: String,
    ) -> Result<Self> {
        config.validate()?;

        let accessor = Arc::new(QueueAccessor::new(
            storage.clone(),
            queue_name.clone(),
            config.clone(),
            clock.clone(),
            owner,
        ));
        let dispatcher =
            Arc::new(Dispatcher::new(accessor.clone(), handler, clock.clone(), config.clone()));
        let reaper =
            Arc::new(Reaper::new(storage.clone(), queue_name.clone(), config.clone(), clock.clone()));

        Ok(Self {
            queue_name,
            processing_off: Arc::new(AtomicBool::new(config.processing_off)),
            config,
            clock,
            storage,
            accessor,
            dispatcher,
            reaper,
            wakeup: Arc::new(Notify::new()),
            poll_cancellation: CancellationToken::new(),
            poll_handle: std::sync::Mutex::new(None),
        })
    }

    /// The logical queue name.
    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    /// Current lifecycle counters.
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.accessor.stats()
    }

    /// Starts the workers, the reaper, and the poll loop.
    pub fn start(&self) {
        self.dispatcher.spawn_workers();
        self.reaper.start();

        let poll = PollLoop {
            accessor: self.accessor.clone(),
            dispatcher: self.dispatcher.clone(),
            clock: self.clock.clone(),
            wakeup: self.wakeup.clone(),
            processing_off: self.processing_off.clone(),
            cancellation: self.poll_cancellation.clone(),
            poll_sleep: self.config.poll_sleep,
        };
        let handle = tokio::spawn(poll.run());
        *self.poll_handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        info!(queue = %self.queue_name, mode = ?self.config.mode, "notification queue started");
    }

    /// Stops the queue: the poll loop first so no new claims are taken,
    /// then the workers (draining or releasing what they hold), then the
    /// reaper.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not exit in time; their
    /// claims are then recovered by another instance's reaper.
    pub async fn stop(&self) -> Result<()> {
        self.poll_cancellation.cancel();
        self.wakeup.notify_waiters();

        let handle = self
            .poll_handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "poll loop task failed");
            }
        }

        let shutdown = self.dispatcher.shutdown().await;
        self.reaper.stop().await;
        shutdown?;

        info!(queue = %self.queue_name, "notification queue stopped");
        Ok(())
    }

    /// Suspends or resumes claiming. While suspended, posted entries
    /// accumulate in the store untouched.
    pub fn set_processing_off(&self, off: bool) {
        self.processing_off.store(off, Ordering::Release);
        if !off {
            self.wakeup.notify_waiters();
        }
    }

    /// Whether claiming is currently suspended.
    pub fn is_processing_off(&self) -> bool {
        self.processing_off.load(Ordering::Acquire)
    }

    /// Posts an event for immediate processing.
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be serialized or the insert
    /// fails.
    pub async fn post<E: QueueEvent>(&self, event: &E) -> Result<RecordId> {
        self.record_notification(self.clock.now_utc(), event, None, 0, 0).await
    }

    /// Posts an event that becomes claimable at `effective_date`, with
    /// correlation token and search keys.
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be serialized or the insert
    /// fails.
    pub async fn record_future_notification<E: QueueEvent>(
        &self,
        effective_date: DateTime<Utc>,
        event: &E,
        user_token: Option<Uuid>,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<RecordId> {
        self.record_notification(effective_date, event, user_token, search_key1, search_key2)
            .await
    }

    async fn record_notification<E: QueueEvent>(
        &self,
        effective_date: DateTime<Utc>,
        event: &E,
        user_token: Option<Uuid>,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<RecordId> {
        let payload =
            serde_json::to_string(event).map_err(|e| QueueError::event_serialization(&e))?;

        let entry = QueueEntry::new(
            self.queue_name.clone(),
            self.accessor.owner().to_string(),
            event.event_type().to_string(),
            payload,
            effective_date,
            user_token,
            search_key1,
            search_key2,
            self.clock.now_utc(),
        );

        let record_id = self.accessor.insert_entry(entry).await?;

        if self.config.mode == PersistentQueueMode::StickyEvents {
            self.wakeup.notify_one();
        }

        Ok(record_id)
    }

    /// Cancels an Available entry, archiving it as Removed. Returns
    /// false when the entry is missing or already claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the removal transaction fails.
    pub async fn remove_entry(&self, record_id: RecordId) -> Result<bool> {
        Ok(self.storage.remove_available(record_id).await?)
    }

    /// Claims one batch of ready entries and processes them inline.
    ///
    /// Synchronous alternative to the poll loop for tests and batch
    /// tooling; returns the number of entries processed.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails. Handler outcomes never error
    /// here; completion failures are logged and left for the reaper.
    pub async fn process_ready_once(&self) -> Result<usize> {
        let entries = self.accessor.get_ready_entries().await?;
        let n = entries.len();
        for entry in entries {
            self.dispatcher.process_now(entry).await;
        }
        Ok(n)
    }

    fn search(&self) -> EntrySearch {
        EntrySearch { queue_name: Some(self.queue_name.clone()), ..EntrySearch::default() }
    }

    /// Available entries of this queue not yet claimed, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn available_entries(&self) -> Result<Vec<QueueEntry>> {
        let filter = EntrySearch { state: Some(ProcessingState::Available), ..self.search() };
        Ok(self.storage.search_live(filter).await?)
    }

    /// Available entries matching a search key 1 value.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn available_entries_for_search_key1(&self, key: i64) -> Result<Vec<QueueEntry>> {
        let filter = EntrySearch {
            state: Some(ProcessingState::Available),
            search_key1: Some(key),
            ..self.search()
        };
        Ok(self.storage.search_live(filter).await?)
    }

    /// Available entries matching a search key 2 value.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn available_entries_for_search_key2(&self, key: i64) -> Result<Vec<QueueEntry>> {
        let filter = EntrySearch {
            state: Some(ProcessingState::Available),
            search_key2: Some(key),
            ..self.search()
        };
        Ok(self.storage.search_live(filter).await?)
    }

    /// Entries of this queue currently claimed by some instance.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn in_processing_entries(&self) -> Result<Vec<QueueEntry>> {
        let filter = EntrySearch { state: Some(ProcessingState::InProcessing), ..self.search() };
        Ok(self.storage.search_live(filter).await?)
    }

    /// Archived entries matching a search key 1 value.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn history_entries_for_search_key1(&self, key: i64) -> Result<Vec<QueueEntry>> {
        let filter = EntrySearch { search_key1: Some(key), ..self.search() };
        Ok(self.storage.search_history(filter).await?)
    }

    /// Archived entries matching a search key 2 value.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn history_entries_for_search_key2(&self, key: i64) -> Result<Vec<QueueEntry>> {
        let filter = EntrySearch { search_key2: Some(key), ..self.search() };
        Ok(self.storage.search_history(filter).await?)
    }

    /// Archived entries effective at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn history_entries_since(&self, since: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        let filter = EntrySearch { since: Some(since), ..self.search() };
        Ok(self.storage.search_history(filter).await?)
    }

    /// Finds an entry by record id, checking the live table first, then
    /// the archive.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_entry(&self, record_id: RecordId) -> Result<Option<QueueEntry>> {
        if let Some(entry) = self.storage.find_live(record_id).await? {
            return Ok(Some(entry));
        }
        Ok(self.storage.find_history(record_id).await?)
    }
}

struct PollLoop {
    accessor: Arc<QueueAccessor>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    wakeup: Arc<Notify>,
    processing_off: Arc<AtomicBool>,
    cancellation: CancellationToken,
    poll_sleep: std::time::Duration,
}

impl PollLoop {
    async fn run(self) {
        loop {
            if self.cancellation.is_cancelled() {
                break;
            }

            if self.processing_off.load(Ordering::Acquire) {
                self.idle().await;
                continue;
            }

            match self.accessor.get_ready_entries().await {
                Ok(entries) if !entries.is_empty() => self.dispatch_batch(entries).await,
                Ok(_) => self.idle().await,
                Err(e) => {
                    warn!(error = %e, "failed to claim ready entries");
                    self.idle().await;
                },
            }
        }
    }

    async fn dispatch_batch(&self, entries: Vec<QueueEntry>) {
        let mut entries = entries.into_iter();
        while let Some(entry) = entries.next() {
            if let Err(e) = self.dispatcher.dispatch(entry).await {
                warn!(error = %e, "dispatch failed, releasing rest of batch");
                let rest: Vec<RecordId> = entries.map(|e| e.record_id).collect();
                if let Err(e) = self.accessor.release_entries(rest).await {
                    error!(error = %e, "failed to release undispatched batch");
                }
                break;
            }
        }
    }

    async fn idle(&self) {
        tokio::select! {
            () = self.cancellation.cancelled() => {},
            () = self.wakeup.notified() => {},
            () = self.clock.sleep(self.poll_sleep) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use carrier_core::{time::fixed_epoch, TestClock};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        handler::{HandlerOutcome, Notification},
        storage::mem::MemoryQueueStorage,
    };

    #[derive(Debug, Serialize, Deserialize)]
    struct InvoiceCreated {
        invoice_id: u64,
    }

    impl QueueEvent for InvoiceCreated {
        fn event_type(&self) -> &str {
            "InvoiceCreated"
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl QueueHandler for CountingHandler {
        async fn handle(&self, _notification: Notification) -> HandlerOutcome {
            self.handled.fetch_add(1, Ordering::AcqRel);
            HandlerOutcome::Success
        }
    }

    struct Fixture {
        queue: NotificationQueue,
        storage: Arc<MemoryQueueStorage>,
        handler: Arc<CountingHandler>,
        clock: TestClock,
    }

    fn fixture(config: QueueConfig) -> Fixture {
        let storage = Arc::new(MemoryQueueStorage::new());
        let clock = TestClock::starting_at(fixed_epoch());
        let handler = Arc::new(CountingHandler::default());
        let queue = NotificationQueue::new(
            QueueName::new("billing", "invoice-events"),
            storage.clone(),
            config,
            Arc::new(clock.clone()),
            handler.clone(),
            "host-a".to_string(),
        )
        .expect("config should be valid");
        Fixture { queue, storage, handler, clock }
    }

    #[tokio::test]
    async fn posted_events_process_in_record_id_order() {
        let f = fixture(QueueConfig { max_entries_claimed: 100, ..QueueConfig::default() });

        let first = f.queue.post(&InvoiceCreated { invoice_id: 1 }).await.unwrap();
        let second = f.queue.post(&InvoiceCreated { invoice_id: 2 }).await.unwrap();
        assert!(first < second);

        let processed = f.queue.process_ready_once().await.unwrap();
        assert_eq!(processed, 2);
        assert_eq!(f.handler.handled.load(Ordering::Acquire), 2);

        let history = f.storage.history_entries().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].record_id, first);
        assert_eq!(history[1].record_id, second);
    }

    #[tokio::test]
    async fn future_notifications_wait_for_their_effective_date() {
        let f = fixture(QueueConfig::default());
        let when = f.clock.now_utc() + chrono::Duration::hours(1);

        let id = f
            .queue
            .record_future_notification(
                when,
                &InvoiceCreated { invoice_id: 7 },
                Some(Uuid::new_v4()),
                42,
                7,
            )
            .await
            .unwrap();

        assert_eq!(f.queue.process_ready_once().await.unwrap(), 0);

        f.clock.advance(Duration::from_secs(3600));
        assert_eq!(f.queue.process_ready_once().await.unwrap(), 1);

        let archived = f.storage.find_history(id).await.unwrap().expect("archived");
        assert_eq!(archived.search_key1, 42);
        assert_eq!(archived.processing_state, ProcessingState::Processed);
    }

    #[tokio::test]
    async fn remove_cancels_only_unclaimed_entries() {
        let f = fixture(QueueConfig::default());
        let id = f.queue.post(&InvoiceCreated { invoice_id: 1 }).await.unwrap();

        assert!(f.queue.remove_entry(id).await.unwrap());
        let archived = f.queue.find_entry(id).await.unwrap().expect("archived");
        assert_eq!(archived.processing_state, ProcessingState::Removed);

        // Nothing left to process, and removing again is a no-op.
        assert_eq!(f.queue.process_ready_once().await.unwrap(), 0);
        assert!(!f.queue.remove_entry(id).await.unwrap());
    }

    #[tokio::test]
    async fn search_api_filters_by_key_state_and_date() {
        let f = fixture(QueueConfig::default());
        let when = f.clock.now_utc() + chrono::Duration::hours(1);

        f.queue
            .record_future_notification(when, &InvoiceCreated { invoice_id: 1 }, None, 10, 20)
            .await
            .unwrap();
        f.queue
            .record_future_notification(when, &InvoiceCreated { invoice_id: 2 }, None, 11, 20)
            .await
            .unwrap();

        assert_eq!(f.queue.available_entries().await.unwrap().len(), 2);
        assert_eq!(f.queue.available_entries_for_search_key1(10).await.unwrap().len(), 1);
        assert_eq!(f.queue.available_entries_for_search_key2(20).await.unwrap().len(), 2);
        assert!(f.queue.in_processing_entries().await.unwrap().is_empty());

        f.clock.advance(Duration::from_secs(3600));
        f.queue.process_ready_once().await.unwrap();

        assert_eq!(f.queue.history_entries_for_search_key1(11).await.unwrap().len(), 1);
        assert_eq!(f.queue.history_entries_for_search_key2(20).await.unwrap().len(), 2);
        assert_eq!(f.queue.history_entries_since(when).await.unwrap().len(), 2);
        assert!(f
            .queue
            .history_entries_since(when + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn kill_switch_suspends_claiming() {
        // Lifecycle test on the system clock: the background loops pace
        // themselves with real sleeps here.
        let storage = Arc::new(MemoryQueueStorage::new());
        let handler = Arc::new(CountingHandler::default());
        let queue = NotificationQueue::new(
            QueueName::new("billing", "invoice-events"),
            storage,
            QueueConfig { poll_sleep: Duration::from_millis(10), ..QueueConfig::default() },
            Arc::new(carrier_core::SystemClock::new()),
            handler.clone(),
            "host-a".to_string(),
        )
        .unwrap();

        queue.set_processing_off(true);
        assert!(queue.is_processing_off());

        queue.post(&InvoiceCreated { invoice_id: 1 }).await.unwrap();

        queue.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.handled.load(Ordering::Acquire), 0);
        assert_eq!(queue.available_entries().await.unwrap().len(), 1);

        queue.set_processing_off(false);
        for _ in 0..100 {
            if handler.handled.load(Ordering::Acquire) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.handled.load(Ordering::Acquire), 1);

        queue.stop().await.unwrap();
    }
}
