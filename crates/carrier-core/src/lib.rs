//! Core domain types for the Carrier durable queue.
//!
//! Provides the queue entry model and its processing-state machine,
//! strongly-typed identifiers, the error taxonomy, a clock abstraction for
//! deterministic testing, and the Postgres repositories backing the live
//! and history tables. The engine crate builds on these foundations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{ProcessingState, QueueEntry, QueueName, RecordId};
pub use time::{Clock, SystemClock, TestClock};
