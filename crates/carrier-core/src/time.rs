//! Clock abstraction for testable timing.
//!
//! Every component takes a clock handle in its constructor instead of
//! reaching for ambient time, so reap thresholds, scheduled notifications,
//! and poll loops can be driven deterministically in tests.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses [`SystemClock`]; tests inject [`TestClock`] to
/// advance time without waiting.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Current wall-clock time for timestamp columns.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by system time and tokio sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock with controllable time progression.
///
/// `advance` moves both the monotonic and wall-clock views forward;
/// `sleep` advances immediately instead of waiting, which lets poll and
/// reaper loops run at full speed under test.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Offset in milliseconds from the base points below.
    offset_ms: Arc<AtomicI64>,
    base_instant: Instant,
    base_utc: DateTime<Utc>,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self {
            offset_ms: Arc::new(AtomicI64::new(0)),
            base_instant: Instant::now(),
            base_utc: Utc::now(),
        }
    }

    /// Creates a test clock starting at a fixed wall-clock time.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            offset_ms: Arc::new(AtomicI64::new(0)),
            base_instant: Instant::now(),
            base_utc: start,
        }
    }

    /// Advances both clock views by the given duration.
    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Jumps the wall clock to a specific time, if it is in the future.
    pub fn jump_to(&self, target: DateTime<Utc>) {
        let current = self.now_utc();
        if target > current {
            let delta = (target - current).to_std().unwrap_or_default();
            self.advance(delta);
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        let offset = self.offset_ms.load(Ordering::Acquire).max(0);
        self.base_instant + Duration::from_millis(offset.unsigned_abs())
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let offset = self.offset_ms.load(Ordering::Acquire);
        self.base_utc + chrono::Duration::milliseconds(offset)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Advance virtual time instead of waiting, then yield so other
        // tasks get a chance to observe it.
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

/// Fixed epoch useful for reproducible fixtures.
pub fn fixed_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_both_views() {
        let clock = TestClock::new();
        let instant_start = clock.now();
        let utc_start = clock.now_utc();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(instant_start), Duration::from_secs(90));
        assert_eq!(clock.now_utc() - utc_start, chrono::Duration::seconds(90));
    }

    #[test]
    fn test_clock_starts_at_fixed_time() {
        let start = fixed_epoch();
        let clock = TestClock::starting_at(start);
        assert_eq!(clock.now_utc(), start);
    }

    #[test]
    fn test_clock_jump_only_moves_forward() {
        let start = fixed_epoch();
        let clock = TestClock::starting_at(start);

        let future = start + chrono::Duration::hours(2);
        clock.jump_to(future);
        assert_eq!(clock.now_utc(), future);

        // A backwards jump is ignored.
        clock.jump_to(start);
        assert_eq!(clock.now_utc(), future);
    }

    #[tokio::test]
    async fn test_clock_sleep_advances_immediately() {
        let clock = TestClock::new();
        let start = clock.now_utc();

        clock.sleep(Duration::from_secs(300)).await;

        assert_eq!(clock.now_utc() - start, chrono::Duration::seconds(300));
    }
}
