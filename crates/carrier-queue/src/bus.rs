//! Event-type routing for bus-style queues.
//!
//! Subscribers register explicitly for the event types they care about;
//! the fanout handler looks up the routing table at delivery time and
//! invokes every matching subscriber. Routing is by the stored event
//! type string, so producers and subscribers only share that name and
//! the payload shape.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::warn;

use crate::handler::{HandlerOutcome, Notification, QueueHandler};

/// A bus subscriber for one or more event types.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handles one notification routed to this subscriber.
    async fn on_event(&self, notification: &Notification) -> HandlerOutcome;
}

/// Routing table from event type name to subscribers.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn Subscriber>>>>,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for an event type. A subscriber may be
    /// registered for several types; a type may have several
    /// subscribers.
    pub async fn subscribe(&self, event_type: &str, subscriber: Arc<dyn Subscriber>) {
        self.subscribers
            .write()
            .await
            .entry(event_type.to_string())
            .or_default()
            .push(subscriber);
    }

    /// Number of subscribers registered for an event type.
    pub async fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers.read().await.get(event_type).map_or(0, Vec::len)
    }

    async fn subscribers_for(&self, event_type: &str) -> Vec<Arc<dyn Subscriber>> {
        self.subscribers.read().await.get(event_type).cloned().unwrap_or_default()
    }
}

/// Queue handler that fans a notification out to every subscriber of
/// its event type.
///
/// Outcomes aggregate by severity: any `Failure` fails the whole
/// notification, otherwise any `RetryLater` retries it (the first
/// subscriber's schedule wins), otherwise it succeeds. On retry every
/// subscriber sees the notification again; subscribers are expected to
/// tolerate redelivery.
pub struct FanoutHandler {
    registry: Arc<SubscriberRegistry>,
}

impl FanoutHandler {
    /// Creates a handler over the given registry.
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl QueueHandler for FanoutHandler {
    async fn handle(&self, notification: Notification) -> HandlerOutcome {
        let subscribers = self.registry.subscribers_for(&notification.event_type).await;

        if subscribers.is_empty() {
            // An unroutable event is complete, not stuck: archive it so
            // it does not clog the queue.
            warn!(
                record_id = %notification.record_id,
                event_type = %notification.event_type,
                "no subscribers for event type"
            );
            return HandlerOutcome::Success;
        }

        // Every subscriber sees the event even when another one fails;
        // only the aggregated outcome is ranked.
        let outcomes =
            join_all(subscribers.iter().map(|s| s.on_event(&notification))).await;

        let mut aggregated = HandlerOutcome::Success;
        for outcome in outcomes {
            match outcome {
                HandlerOutcome::Failure(reason) => {
                    aggregated = HandlerOutcome::Failure(reason);
                },
                HandlerOutcome::RetryLater(schedule) => {
                    if matches!(aggregated, HandlerOutcome::Success) {
                        aggregated = HandlerOutcome::RetryLater(schedule);
                    }
                },
                HandlerOutcome::Success => {},
            }
        }
        aggregated
    }
}
