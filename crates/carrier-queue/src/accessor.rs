//! Claim-side access to the queue store.
//!
//! The accessor owns the identity stamped on claims, the lifecycle
//! counters, and the sticky in-flight buffer. All claim, release, and
//! archive traffic from the engine flows through here so the counters
//! stay consistent with what actually happened in the store.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use carrier_core::{Clock, ProcessingState, QueueEntry, QueueName, RecordId};
use tracing::{debug, trace};

use crate::{config::QueueConfig, error::Result, storage::QueueStorage};

/// Point-in-time view of the lifecycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    /// Entries written through this accessor.
    pub inserted: u64,
    /// Entries claimed by this accessor.
    pub claimed: u64,
    /// Entries archived as Processed.
    pub processed: u64,
    /// Entries archived as Failed.
    pub failed: u64,
    /// Claimed entries returned to the Available pool.
    pub released: u64,
    /// Entries currently claimed by this accessor and not yet completed.
    pub in_processing: u64,
}

#[derive(Debug, Default)]
struct Counters {
    inserted: AtomicU64,
    claimed: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    released: AtomicU64,
    in_processing: AtomicU64,
}

impl Counters {
    fn sub_in_processing(&self, n: u64) {
        let _ = self
            .in_processing
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)));
    }

    fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            inserted: self.inserted.load(Ordering::Acquire),
            claimed: self.claimed.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
            in_processing: self.in_processing.load(Ordering::Acquire),
        }
    }
}

/// Bounded buffer of locally created record ids, used by the sticky
/// modes to claim fresh entries without a table scan.
///
/// The buffer is a hint, never an authority: ids taken from it still go
/// through a conditional claim, and an overflow closes both gates so
/// discovery falls back to plain polling. Once closed it only reopens
/// when the database backlog has drained to the low watermark, otherwise
/// the local view would keep missing entries created elsewhere.
#[derive(Debug)]
struct InflightBuffer {
    capacity: usize,
    low_watermark: usize,
    ids: VecDeque<RecordId>,
    open_for_read: bool,
    open_for_write: bool,
}

impl InflightBuffer {
    fn new(capacity: usize, low_watermark: usize) -> Self {
        Self {
            capacity,
            low_watermark,
            ids: VecDeque::with_capacity(capacity),
            open_for_read: true,
            open_for_write: true,
        }
    }

    /// Offers a freshly inserted id. Returns false when the buffer is
    /// closed or this offer overflowed it.
    fn offer(&mut self, id: RecordId) -> bool {
        if !self.open_for_write {
            return false;
        }
        if self.ids.len() == self.capacity {
            self.close();
            return false;
        }
        self.ids.push_back(id);
        true
    }

    /// Takes up to `max` buffered ids for claiming.
    fn poll(&mut self, max: usize) -> Vec<RecordId> {
        if !self.open_for_read {
            return Vec::new();
        }
        let n = max.min(self.ids.len());
        self.ids.drain(..n).collect()
    }

    fn close(&mut self) {
        self.open_for_write = false;
        self.open_for_read = false;
        // Dropped ids are still rows in the store; polling finds them.
        self.ids.clear();
    }

    fn is_closed(&self) -> bool {
        !self.open_for_write
    }

    fn maybe_reopen(&mut self, backlog: i64) {
        if backlog <= i64::try_from(self.low_watermark).unwrap_or(i64::MAX) {
            self.open_for_write = true;
            self.open_for_read = true;
        }
    }
}

/// Claim-side gateway between the engine and the store.
///
/// Bound to one logical queue: claims, counts, and buffer hints never
/// see entries of other queues sharing the store.
pub struct QueueAccessor {
    storage: Arc<dyn QueueStorage>,
    queue_name: QueueName,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    owner: String,
    counters: Counters,
    inflight: Mutex<InflightBuffer>,
}

impl QueueAccessor {
    /// Creates an accessor claiming entries of `queue_name` on behalf of
    /// `owner`.
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        queue_name: QueueName,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        owner: String,
    ) -> Self {
        let inflight =
            Mutex::new(InflightBuffer::new(config.inflight_capacity, config.inflight_low_watermark));
        Self { storage, queue_name, config, clock, owner, counters: Counters::default(), inflight }
    }

    /// The claim identity stamped on entries this accessor processes.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The underlying storage handle.
    pub fn storage(&self) -> &Arc<dyn QueueStorage> {
        &self.storage
    }

    /// Current counter values.
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.counters.snapshot()
    }

    fn buffer(&self) -> MutexGuard<'_, InflightBuffer> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists a new entry, feeding the in-flight buffer in sticky
    /// modes.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails; nothing is buffered in that
    /// case.
    pub async fn insert_entry(&self, entry: QueueEntry) -> Result<RecordId> {
        let record_id = self.storage.insert(entry).await?;
        self.counters.inserted.fetch_add(1, Ordering::AcqRel);

        if self.config.mode.is_sticky() {
            let accepted = self.buffer().offer(record_id);
            if !accepted {
                trace!(%record_id, "in-flight buffer closed, entry left for polling");
            }
        }

        Ok(record_id)
    }

    /// Claims the next batch of ready entries for this owner.
    ///
    /// In sticky modes, buffered ids are tried first through a
    /// conditional claim; whatever they miss (raced away, not yet
    /// effective) falls through to the regular scan on the next tick.
    ///
    /// # Errors
    ///
    /// Returns error if the claim query fails. No partial claims leak:
    /// either a batch is returned or nothing changed state.
    pub async fn get_ready_entries(&self) -> Result<Vec<QueueEntry>> {
        let started = self.clock.now();
        let now = self.clock.now_utc();
        let limit = self.config.max_entries_claimed;

        let mut entries = Vec::new();
        if self.config.mode.is_sticky() {
            let hinted = self.buffer().poll(limit);
            if !hinted.is_empty() {
                entries = self
                    .storage
                    .claim_specific(self.queue_name.clone(), self.owner.clone(), hinted, now)
                    .await?;
            }
        }

        if entries.is_empty() {
            entries = self
                .storage
                .claim_ready(self.queue_name.clone(), self.owner.clone(), now, limit)
                .await?;

            if self.config.mode.is_sticky() && self.buffer().is_closed() {
                let backlog = self.storage.count_available(self.queue_name.clone()).await?;
                self.buffer().maybe_reopen(backlog);
            }
        }

        if !entries.is_empty() {
            let n = entries.len() as u64;
            self.counters.claimed.fetch_add(n, Ordering::AcqRel);
            self.counters.in_processing.fetch_add(n, Ordering::AcqRel);

            let elapsed = self.clock.now().saturating_duration_since(started);
            debug!(
                claimed = entries.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "claimed ready entries"
            );
        }

        Ok(entries)
    }

    /// Archives a completed entry with its terminal state.
    ///
    /// Returns false when the live row was already gone.
    ///
    /// # Errors
    ///
    /// Returns error if the archive transaction fails; the entry stays
    /// InProcessing and the reaper will eventually recover it.
    pub async fn move_entry_to_history(
        &self,
        record_id: RecordId,
        terminal_state: ProcessingState,
    ) -> Result<bool> {
        let moved = self.storage.move_to_history(record_id, terminal_state).await?;
        if moved {
            self.counters.sub_in_processing(1);
            match terminal_state {
                ProcessingState::Processed => {
                    self.counters.processed.fetch_add(1, Ordering::AcqRel);
                },
                ProcessingState::Failed => {
                    self.counters.failed.fetch_add(1, Ordering::AcqRel);
                },
                _ => {},
            }
        }
        Ok(moved)
    }

    /// Returns claimed entries to the Available pool.
    ///
    /// # Errors
    ///
    /// Returns error if the release update fails.
    pub async fn release_entries(&self, record_ids: Vec<RecordId>) -> Result<u64> {
        if record_ids.is_empty() {
            return Ok(0);
        }
        let released = self.storage.release(self.owner.clone(), record_ids).await?;
        if released > 0 {
            self.counters.released.fetch_add(released, Ordering::AcqRel);
            self.counters.sub_in_processing(released);
        }
        Ok(released)
    }
}
