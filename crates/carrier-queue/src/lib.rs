//! Durable notification queue engine over a shared database.
//!
//! Entries are posted as rows, claimed atomically by competing
//! instances, handed to a worker pool, and archived to an append-only
//! history table once terminal. Failed attempts retry through fresh
//! future-dated entries; abandoned claims are recovered by a background
//! reaper. See [`queue::NotificationQueue`] for the main entry point and
//! [`bus`] for event-type routing on top of it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accessor;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod storage;

pub use accessor::{QueueAccessor, QueueStatsSnapshot};
pub use bus::{FanoutHandler, Subscriber, SubscriberRegistry};
pub use config::{PersistentQueueMode, QueueConfig};
pub use dispatcher::Dispatcher;
pub use error::{QueueError, Result};
pub use handler::{HandlerOutcome, Notification, QueueEvent, QueueHandler};
pub use queue::NotificationQueue;
pub use reaper::Reaper;
pub use retry::{RetryContext, RetryDecision, RetrySchedule};
pub use storage::{PostgresQueueStorage, QueueStorage};
