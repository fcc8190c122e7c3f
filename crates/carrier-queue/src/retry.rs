//! Retry scheduling over the durable queue.
//!
//! A retry is not an in-place update: each attempt is a fresh entry with
//! a future effective date and an incremented error count, while the
//! failed attempt is archived. The schedule is a finite list of delays,
//! indexed by how many times the notification has already failed.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Ordered list of delays between retry attempts.
///
/// An entry whose error count is `k` waits `intervals[k]` before its next
/// attempt; an error count at or past the end means the schedule is
/// exhausted. An N-element schedule therefore allows exactly N retries
/// after the original attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    intervals: Vec<Duration>,
}

impl RetrySchedule {
    /// Creates a schedule from the given delays.
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    /// A schedule that never retries.
    pub fn none() -> Self {
        Self { intervals: Vec::new() }
    }

    /// Number of retry attempts this schedule allows.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Whether the schedule allows no retries at all.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Delay before the next attempt for an entry that has already failed
    /// `error_count` times, or None when exhausted.
    pub fn interval_for(&self, error_count: i64) -> Option<Duration> {
        usize::try_from(error_count).ok().and_then(|i| self.intervals.get(i).copied())
    }
}

impl Default for RetrySchedule {
    /// Three attempts at increasing delays, then give up.
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(5 * 60),
            Duration::from_secs(15 * 60),
            Duration::from_secs(60 * 60),
        ])
    }
}

/// What to do with a notification whose handler asked for a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule a new attempt.
    Reschedule {
        /// When the new entry becomes claimable.
        effective_date: DateTime<Utc>,
        /// Error count carried by the new entry.
        error_count: i64,
    },

    /// The schedule is exhausted; the notification fails terminally.
    GiveUp,
}

/// Inputs for one retry decision.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// How many times this notification has failed before the current
    /// attempt.
    pub error_count: i64,

    /// When the current attempt failed.
    pub failed_at: DateTime<Utc>,
}

impl RetryContext {
    /// Creates a retry context.
    pub fn new(error_count: i64, failed_at: DateTime<Utc>) -> Self {
        Self { error_count, failed_at }
    }

    /// Decides whether and when to retry under the given schedule.
    pub fn decide(&self, schedule: &RetrySchedule) -> RetryDecision {
        match schedule.interval_for(self.error_count) {
            Some(delay) => RetryDecision::Reschedule {
                effective_date: self.failed_at
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX),
                error_count: self.error_count + 1,
            },
            None => RetryDecision::GiveUp,
        }
    }
}
