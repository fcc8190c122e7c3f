//! Test harness for Carrier integration and unit tests.
//!
//! Provides a deterministic queue environment over the in-memory store,
//! fixture builders, and stock handlers. Tests drive time through the
//! shared test clock instead of sleeping.

pub mod fixtures;
pub mod handlers;

use std::sync::Arc;

use anyhow::Result;
use carrier_core::{time::fixed_epoch, QueueName, TestClock};
use carrier_queue::{
    storage::mem::MemoryQueueStorage, NotificationQueue, QueueConfig, QueueHandler,
};
use tracing_subscriber::EnvFilter;

/// Test environment with queue infrastructure on an in-memory store.
pub struct TestEnv {
    /// Shared store, also usable directly for state verification.
    pub storage: Arc<MemoryQueueStorage>,
    /// Controllable clock shared with every queue built from this env.
    pub clock: TestClock,
    /// Configuration used for queues built from this env.
    pub config: QueueConfig,
}

impl TestEnv {
    /// Creates a test environment with default configuration.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Creates a test environment with custom configuration.
    pub fn with_config(config: QueueConfig) -> Self {
        // Initialize tracing for tests
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("warn,carrier=debug")),
            )
            .with_test_writer()
            .try_init();

        Self {
            storage: Arc::new(MemoryQueueStorage::new()),
            clock: TestClock::starting_at(fixed_epoch()),
            config,
        }
    }

    /// The logical queue name used by queues built from this env.
    pub fn queue_name(&self) -> QueueName {
        QueueName::new("billing", "invoice-events")
    }

    /// Builds a queue named `billing:invoice-events` over this
    /// environment's store and clock.
    ///
    /// # Errors
    ///
    /// Returns error for an invalid configuration.
    pub fn queue(&self, handler: Arc<dyn QueueHandler>, owner: &str) -> Result<NotificationQueue> {
        Ok(NotificationQueue::new(
            self.queue_name(),
            self.storage.clone(),
            self.config.clone(),
            Arc::new(self.clock.clone()),
            handler,
            owner.to_string(),
        )?)
    }

    /// Advances the shared test clock.
    pub fn advance_time(&self, duration: std::time::Duration) {
        self.clock.advance(duration);
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
