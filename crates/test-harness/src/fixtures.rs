//! Builders for queue entries and events used across tests.

use carrier_core::{QueueEntry, QueueName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stock domain event for tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCreated {
    /// Arbitrary payload field, handy for asserting ordering.
    pub invoice_id: u64,
}

impl carrier_queue::QueueEvent for InvoiceCreated {
    fn event_type(&self) -> &str {
        "InvoiceCreated"
    }
}

/// Builder for queue entries inserted directly into a store.
pub struct EntryBuilder {
    queue_name: QueueName,
    creating_owner: String,
    event_type: String,
    event_payload: String,
    effective_date: DateTime<Utc>,
    user_token: Option<Uuid>,
    search_key1: i64,
    search_key2: i64,
    error_count: i64,
    created_date: DateTime<Utc>,
}

impl EntryBuilder {
    /// Creates a builder for an entry effective at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            queue_name: QueueName::new("billing", "invoice-events"),
            creating_owner: "test-host".to_string(),
            event_type: "InvoiceCreated".to_string(),
            event_payload: r#"{"invoice_id":1}"#.to_string(),
            effective_date: now,
            user_token: None,
            search_key1: 0,
            search_key2: 0,
            error_count: 0,
            created_date: now,
        }
    }

    /// Sets the creating owner.
    #[must_use]
    pub fn owner(mut self, owner: &str) -> Self {
        self.creating_owner = owner.to_string();
        self
    }

    /// Sets the event type and payload.
    #[must_use]
    pub fn event(mut self, event_type: &str, payload: &str) -> Self {
        self.event_type = event_type.to_string();
        self.event_payload = payload.to_string();
        self
    }

    /// Sets when the entry becomes claimable.
    #[must_use]
    pub fn effective_at(mut self, when: DateTime<Utc>) -> Self {
        self.effective_date = when;
        self
    }

    /// Sets the correlation token.
    #[must_use]
    pub fn user_token(mut self, token: Uuid) -> Self {
        self.user_token = Some(token);
        self
    }

    /// Sets both search keys.
    #[must_use]
    pub fn search_keys(mut self, key1: i64, key2: i64) -> Self {
        self.search_key1 = key1;
        self.search_key2 = key2;
        self
    }

    /// Sets the accumulated error count.
    #[must_use]
    pub fn error_count(mut self, count: i64) -> Self {
        self.error_count = count;
        self
    }

    /// Builds the entry.
    pub fn build(self) -> QueueEntry {
        let mut entry = QueueEntry::new(
            self.queue_name,
            self.creating_owner,
            self.event_type,
            self.event_payload,
            self.effective_date,
            self.user_token,
            self.search_key1,
            self.search_key2,
            self.created_date,
        );
        entry.error_count = self.error_count;
        entry
    }
}
