//! Stock queue handlers with inspectable behavior.

use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Mutex, PoisonError,
};

use async_trait::async_trait;
use carrier_queue::{HandlerOutcome, Notification, QueueHandler, RetrySchedule};

/// Handler that succeeds and records every notification it sees.
#[derive(Default)]
pub struct CountingHandler {
    seen: Mutex<Vec<Notification>>,
}

impl CountingHandler {
    /// Creates an empty counting handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications handled so far.
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Copies of every handled notification, in handling order.
    pub fn seen(&self) -> Vec<Notification> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl QueueHandler for CountingHandler {
    async fn handle(&self, notification: Notification) -> HandlerOutcome {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).push(notification);
        HandlerOutcome::Success
    }
}

/// Handler that always fails terminally.
pub struct FailingHandler {
    reason: String,
    calls: AtomicUsize,
}

impl FailingHandler {
    /// Creates a handler failing with the given reason.
    pub fn new(reason: &str) -> Self {
        Self { reason: reason.to_string(), calls: AtomicUsize::new(0) }
    }

    /// Number of notifications seen.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl QueueHandler for FailingHandler {
    async fn handle(&self, _notification: Notification) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::AcqRel);
        HandlerOutcome::Failure(self.reason.clone())
    }
}

/// Handler that always asks for a retry under a fixed schedule.
pub struct RetryingHandler {
    schedule: RetrySchedule,
    calls: AtomicUsize,
}

impl RetryingHandler {
    /// Creates a handler retrying under the given schedule.
    pub fn new(schedule: RetrySchedule) -> Self {
        Self { schedule, calls: AtomicUsize::new(0) }
    }

    /// Number of notifications seen.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl QueueHandler for RetryingHandler {
    async fn handle(&self, _notification: Notification) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::AcqRel);
        HandlerOutcome::RetryLater(self.schedule.clone())
    }
}

/// Handler that fails a fixed number of times, then succeeds.
pub struct FlakyHandler {
    schedule: RetrySchedule,
    failures_remaining: AtomicI64,
    calls: AtomicUsize,
}

impl FlakyHandler {
    /// Creates a handler failing `failures` times under `schedule`
    /// before succeeding.
    pub fn new(failures: i64, schedule: RetrySchedule) -> Self {
        Self { schedule, failures_remaining: AtomicI64::new(failures), calls: AtomicUsize::new(0) }
    }

    /// Number of notifications seen.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl QueueHandler for FlakyHandler {
    async fn handle(&self, _notification: Notification) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::AcqRel);
        if self.failures_remaining.fetch_sub(1, Ordering::AcqRel) > 0 {
            HandlerOutcome::RetryLater(self.schedule.clone())
        } else {
            HandlerOutcome::Success
        }
    }
}
