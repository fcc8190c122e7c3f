//! Dispatch of claimed entries to handler workers.
//!
//! The poll loop feeds claimed entries into a bounded work queue; a
//! fixed pool of workers drains it, invokes the handler, and applies the
//! outcome: archive, terminal failure, or retry via a fresh entry. A
//! worker panic is contained to its task and the abandoned claim is
//! recovered by the reaper.

use std::sync::Arc;

use carrier_core::{Clock, ProcessingState, QueueEntry, RecordId};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    accessor::QueueAccessor,
    config::QueueConfig,
    error::{QueueError, Result},
    handler::{HandlerOutcome, Notification, QueueHandler},
    retry::{RetryContext, RetryDecision, RetrySchedule},
};

/// Worker pool consuming claimed entries from a bounded channel.
pub struct Dispatcher {
    accessor: Arc<QueueAccessor>,
    handler: Arc<dyn QueueHandler>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    tx: mpsc::Sender<QueueEntry>,
    rx: Arc<Mutex<mpsc::Receiver<QueueEntry>>>,
    cancellation: CancellationToken,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
    /// Creates a dispatcher; workers start on [`Dispatcher::spawn_workers`].
    pub fn new(
        accessor: Arc<QueueAccessor>,
        handler: Arc<dyn QueueHandler>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.work_queue_capacity);
        Self {
            accessor,
            handler,
            clock,
            config,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            cancellation: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawns the configured number of worker tasks.
    pub fn spawn_workers(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for id in 0..self.config.worker_count {
            let worker = DispatchWorker {
                id,
                accessor: self.accessor.clone(),
                handler: self.handler.clone(),
                clock: self.clock.clone(),
                rx: self.rx.clone(),
                cancellation: self.cancellation.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        info!(worker_count = self.config.worker_count, "dispatch workers started");
    }

    /// Hands a claimed entry to the worker pool.
    ///
    /// Blocks while the work queue is full, but never longer than the
    /// claim time: past that the claim is released so another instance
    /// can pick the entry up, and the error tells the poll loop to back
    /// off.
    ///
    /// # Errors
    ///
    /// Returns `DispatchTimeout` when no worker took the entry in time.
    pub async fn dispatch(&self, entry: QueueEntry) -> Result<()> {
        let record_id = entry.record_id;
        let timeout = self.config.claim_time;

        match tokio::time::timeout(timeout, self.tx.send(entry)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                warn!(%record_id, "no worker available, releasing claim");
                self.accessor.release_entries(vec![record_id]).await?;
                Err(QueueError::DispatchTimeout { record_id, timeout })
            },
        }
    }

    /// Processes one entry inline, bypassing the worker pool.
    ///
    /// Used by the synchronous draining path in tests and batch tooling.
    pub async fn process_now(&self, entry: QueueEntry) {
        process_entry(&self.accessor, self.handler.as_ref(), self.clock.as_ref(), entry).await;
    }

    /// Stops the workers and releases any entries left in the work
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not exit within the
    /// configured grace period; queued claims are then recovered by the
    /// reaper instead.
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        self.cancellation.cancel();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        let joined = tokio::time::timeout(timeout, async {
            for (worker_id, handle) in workers.into_iter().enumerate() {
                if let Err(e) = handle.await {
                    return Err(QueueError::WorkerFailed { worker_id, message: e.to_string() });
                }
            }
            Ok(())
        })
        .await;

        match joined {
            Ok(result) => result?,
            Err(_) => return Err(QueueError::ShutdownTimeout { timeout }),
        }

        // Entries still in the channel were claimed but never handled.
        let mut leftover = Vec::new();
        {
            let mut rx = self.rx.lock().await;
            while let Ok(entry) = rx.try_recv() {
                leftover.push(entry.record_id);
            }
        }
        if !leftover.is_empty() {
            let released = self.accessor.release_entries(leftover).await?;
            info!(released, "released undispatched entries during shutdown");
        }

        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

struct DispatchWorker {
    id: usize,
    accessor: Arc<QueueAccessor>,
    handler: Arc<dyn QueueHandler>,
    clock: Arc<dyn Clock>,
    rx: Arc<Mutex<mpsc::Receiver<QueueEntry>>>,
    cancellation: CancellationToken,
}

impl DispatchWorker {
    async fn run(self) {
        debug!(worker_id = self.id, "dispatch worker started");
        loop {
            let entry = tokio::select! {
                () = self.cancellation.cancelled() => break,
                entry = Self::next_entry(&self.rx) => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            process_entry(&self.accessor, self.handler.as_ref(), self.clock.as_ref(), entry)
                .await;
        }
        debug!(worker_id = self.id, "dispatch worker stopped");
    }

    async fn next_entry(rx: &Mutex<mpsc::Receiver<QueueEntry>>) -> Option<QueueEntry> {
        rx.lock().await.recv().await
    }
}

/// Runs the handler for one claimed entry and applies its outcome.
pub(crate) async fn process_entry(
    accessor: &QueueAccessor,
    handler: &dyn QueueHandler,
    clock: &dyn Clock,
    entry: QueueEntry,
) {
    let record_id = entry.record_id;

    // A payload that does not even parse as JSON cannot reach a handler.
    // Release rather than archive: the entry stays visible for operators
    // and a fixed deployment can still process it.
    if let Err(e) = serde_json::from_str::<serde_json::Value>(&entry.event_payload) {
        warn!(%record_id, error = %e, "undeserializable payload, releasing entry");
        if let Err(e) = accessor.release_entries(vec![record_id]).await {
            error!(%record_id, error = %e, "failed to release poison entry");
        }
        return;
    }

    let outcome = handler.handle(Notification::from_entry(&entry)).await;
    let result = match outcome {
        HandlerOutcome::Success => {
            accessor.move_entry_to_history(record_id, ProcessingState::Processed).await.map(|_| ())
        },
        HandlerOutcome::Failure(reason) => {
            error!(%record_id, %reason, "handler failed terminally");
            accessor.move_entry_to_history(record_id, ProcessingState::Failed).await.map(|_| ())
        },
        HandlerOutcome::RetryLater(schedule) => {
            schedule_retry(accessor, clock, &entry, &schedule).await
        },
    };

    if let Err(e) = result {
        // The entry stays InProcessing; the reaper recovers it.
        error!(%record_id, error = %e, "failed to record entry outcome");
    }
}

/// Applies a `RetryLater` outcome.
///
/// A retry is a fresh Available entry with a future effective date and
/// an incremented error count; the failed attempt is archived as
/// Processed since its handling completed with a decision. Exhausted
/// schedules archive the attempt as Failed.
async fn schedule_retry(
    accessor: &QueueAccessor,
    clock: &dyn Clock,
    entry: &QueueEntry,
    schedule: &RetrySchedule,
) -> Result<()> {
    let record_id = entry.record_id;
    let now = clock.now_utc();

    match RetryContext::new(entry.error_count, now).decide(schedule) {
        RetryDecision::Reschedule { effective_date, error_count } => {
            let attempt = retry_attempt(entry, accessor.owner(), effective_date, error_count, now);
            match accessor.insert_entry(attempt).await {
                Ok(retry_id) => {
                    debug!(
                        %record_id,
                        %retry_id,
                        error_count,
                        %effective_date,
                        "scheduled retry attempt"
                    );
                    accessor.move_entry_to_history(record_id, ProcessingState::Processed).await?;
                    Ok(())
                },
                Err(e) => {
                    // Without a persisted retry the original must stay
                    // claimable, otherwise the notification is lost.
                    warn!(%record_id, error = %e, "failed to persist retry, releasing entry");
                    accessor.release_entries(vec![record_id]).await?;
                    Err(e)
                },
            }
        },
        RetryDecision::GiveUp => {
            warn!(
                %record_id,
                error_count = entry.error_count,
                "retry schedule exhausted, failing terminally"
            );
            accessor.move_entry_to_history(record_id, ProcessingState::Failed).await?;
            Ok(())
        },
    }
}

fn retry_attempt(
    original: &QueueEntry,
    owner: &str,
    effective_date: chrono::DateTime<chrono::Utc>,
    error_count: i64,
    now: chrono::DateTime<chrono::Utc>,
) -> QueueEntry {
    QueueEntry {
        record_id: RecordId::UNASSIGNED,
        queue_name: original.queue_name.clone(),
        creating_owner: owner.to_string(),
        processing_owner: None,
        processing_state: ProcessingState::Available,
        processing_claimed_date: None,
        event_type: original.event_type.clone(),
        event_payload: original.event_payload.clone(),
        user_token: original.user_token,
        future_user_token: Some(Uuid::new_v4()),
        search_key1: original.search_key1,
        search_key2: original.search_key2,
        effective_date,
        error_count,
        created_date: now,
    }
}
