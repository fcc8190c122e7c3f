//! Error types for the queue engine.

use std::time::Duration;

use carrier_core::{CoreError, RecordId};
use thiserror::Error;

/// Result type alias using `QueueError`.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors surfaced by the queue engine.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// Event payload could not be serialized for posting.
    #[error("event serialization failed: {message}")]
    EventSerialization {
        /// Underlying serializer message.
        message: String,
    },

    /// The internal work queue rejected an entry because every worker was
    /// busy for longer than the claim time.
    #[error("dispatch of entry {record_id} timed out after {timeout:?}")]
    DispatchTimeout {
        /// Entry that could not be handed to a worker.
        record_id: RecordId,
        /// How long the dispatcher waited.
        timeout: Duration,
    },

    /// Workers did not drain and exit within the shutdown timeout.
    #[error("shutdown did not complete within {timeout:?}")]
    ShutdownTimeout {
        /// Configured shutdown grace period.
        timeout: Duration,
    },

    /// A worker task panicked or was aborted.
    #[error("worker {worker_id} failed: {message}")]
    WorkerFailed {
        /// Index of the failed worker.
        worker_id: usize,
        /// Join error description.
        message: String,
    },

    /// Invalid engine configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },
}

impl QueueError {
    /// Creates an event serialization error.
    pub fn event_serialization(err: &serde_json::Error) -> Self {
        Self::EventSerialization { message: err.to_string() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the failed operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::DispatchTimeout { .. } => true,
            Self::EventSerialization { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerFailed { .. }
            | Self::Configuration { .. } => false,
        }
    }
}
