//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Grace period added on top of the claim time before a claim may be
/// considered stale. Keeps the reaper from racing a worker that is slow
/// but alive.
pub const REAP_GRACE: Duration = Duration::from_secs(5 * 60);

/// How claimable entries reach this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistentQueueMode {
    /// Pure polling. Every instance discovers entries by querying the
    /// database on a timer.
    Polling,

    /// Polling plus a bounded in-flight buffer of locally created record
    /// ids, claimed preferentially before the database scan.
    StickyPolling,

    /// Sticky buffering plus an in-process wakeup on insert, so locally
    /// created entries are picked up without waiting out the poll sleep.
    StickyEvents,
}

impl PersistentQueueMode {
    /// Whether this mode maintains the in-flight buffer.
    pub const fn is_sticky(self) -> bool {
        matches!(self, Self::StickyPolling | Self::StickyEvents)
    }
}

/// Configuration for one queue instance.
///
/// Durations deserialize in the serde default `{ "secs": .., "nanos": .. }`
/// form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Live table name.
    pub table_name: String,

    /// Append-only history table name.
    pub history_table_name: String,

    /// Maximum entries claimed per poll tick.
    pub max_entries_claimed: usize,

    /// Nominal time a claim is expected to be held. Bounds dispatch
    /// blocking and feeds the reaper period.
    pub claim_time: Duration,

    /// Minimum age of a claim before the reaper may reset it.
    pub reap_threshold: Duration,

    /// Pause between poll ticks when no work was found.
    pub poll_sleep: Duration,

    /// Number of dispatch workers.
    pub worker_count: usize,

    /// Capacity of the internal work queue between the poll loop and the
    /// workers.
    pub work_queue_capacity: usize,

    /// Grace period for workers to finish during shutdown.
    pub shutdown_timeout: Duration,

    /// Entry discovery mode.
    pub mode: PersistentQueueMode,

    /// Kill switch: when set, the poll loop idles and entries accumulate
    /// in the database untouched.
    pub processing_off: bool,

    /// Capacity of the sticky in-flight buffer.
    pub inflight_capacity: usize,

    /// Database backlog at or below which a closed buffer reopens for
    /// writes.
    pub inflight_low_watermark: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            table_name: "queue_entries".to_string(),
            history_table_name: "queue_entries_history".to_string(),
            max_entries_claimed: 10,
            claim_time: Duration::from_secs(5 * 60),
            reap_threshold: Duration::from_secs(10 * 60),
            poll_sleep: Duration::from_secs(3),
            worker_count: 3,
            work_queue_capacity: 100,
            shutdown_timeout: Duration::from_secs(30),
            mode: PersistentQueueMode::Polling,
            processing_off: false,
            inflight_capacity: 100,
            inflight_low_watermark: 10,
        }
    }
}

impl QueueConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Configuration` for values the engine cannot
    /// run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(QueueError::configuration("worker_count must be at least 1"));
        }
        if self.max_entries_claimed == 0 {
            return Err(QueueError::configuration("max_entries_claimed must be at least 1"));
        }
        if self.work_queue_capacity == 0 {
            return Err(QueueError::configuration("work_queue_capacity must be at least 1"));
        }
        if self.mode.is_sticky() {
            if self.inflight_capacity == 0 {
                return Err(QueueError::configuration(
                    "inflight_capacity must be at least 1 in sticky modes",
                ));
            }
            if self.inflight_low_watermark > self.inflight_capacity {
                return Err(QueueError::configuration(
                    "inflight_low_watermark must not exceed inflight_capacity",
                ));
            }
        }
        Ok(())
    }

    /// Interval between reaper sweeps, also used as the staleness cutoff.
    ///
    /// Never shorter than the claim time plus grace, whatever the
    /// configured threshold says, so an honest in-flight claim cannot be
    /// stolen.
    pub fn reap_period(&self) -> Duration {
        self.reap_threshold.max(self.claim_time + REAP_GRACE)
    }
}
