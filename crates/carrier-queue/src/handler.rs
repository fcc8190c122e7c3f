//! Handler surface: what subscribers implement and what they receive.
//!
//! Handler outcomes are explicit values, not control flow. A handler that
//! wants a retry returns `RetryLater` with its schedule; a handler that
//! fails terminally returns `Failure` with a reason. Panics inside a
//! handler take down only the worker task and leave the claim for the
//! reaper.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use carrier_core::{CoreError, QueueEntry, QueueName, RecordId};

use crate::retry::RetrySchedule;

/// A domain event postable to the queue.
///
/// The event type name is stored alongside the serialized payload and
/// routes the notification to its subscribers on delivery.
pub trait QueueEvent: Serialize + Send + Sync {
    /// Type discriminator stored with the entry.
    fn event_type(&self) -> &str;
}

/// Read-only view of a claimed entry handed to handlers.
///
/// Deliberately omits the mutable processing fields; handlers report
/// outcomes, they do not drive state transitions.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Record id of the underlying entry.
    pub record_id: RecordId,

    /// Logical queue the entry belongs to.
    pub queue_name: QueueName,

    /// Event type discriminator.
    pub event_type: String,

    /// Serialized JSON payload.
    pub event_payload: String,

    /// When the entry became claimable.
    pub effective_date: DateTime<Utc>,

    /// Correlation token from the originating request.
    pub user_token: Option<Uuid>,

    /// Correlation token linking retries, if this is a retry attempt.
    pub future_user_token: Option<Uuid>,

    /// Caller-opaque filter key.
    pub search_key1: i64,

    /// Caller-opaque filter key.
    pub search_key2: i64,

    /// Failures accumulated across this notification's retry chain.
    pub error_count: i64,
}

impl Notification {
    pub(crate) fn from_entry(entry: &QueueEntry) -> Self {
        Self {
            record_id: entry.record_id,
            queue_name: entry.queue_name.clone(),
            event_type: entry.event_type.clone(),
            event_payload: entry.event_payload.clone(),
            effective_date: entry.effective_date,
            user_token: entry.user_token,
            future_user_token: entry.future_user_token,
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
            error_count: entry.error_count,
        }
    }

    /// Deserializes the payload into a typed event.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the payload does not match
    /// the expected shape.
    pub fn event<E: DeserializeOwned>(&self) -> Result<E, CoreError> {
        Ok(serde_json::from_str(&self.event_payload)?)
    }
}

/// Result of handling one notification.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// The notification was handled; archive it as Processed.
    Success,

    /// Handling failed transiently; schedule another attempt under the
    /// given schedule.
    RetryLater(RetrySchedule),

    /// Handling failed terminally; archive as Failed.
    Failure(String),
}

/// Processes claimed notifications.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    /// Handles one notification and reports the outcome.
    async fn handle(&self, notification: Notification) -> HandlerOutcome;
}
