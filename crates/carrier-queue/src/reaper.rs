//! Recovery of claims abandoned by crashed or partitioned instances.
//!
//! A fixed-delay sweep resets InProcessing entries whose claim stamp is
//! older than the reap period back to Available. The period doubles as
//! the staleness cutoff and is floored at the claim time plus a grace
//! margin, so a slow but live worker never has its claim stolen. Reaped
//! entries keep their error count: being reaped is not a failure.

use std::sync::Arc;

use carrier_core::{Clock, QueueName};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::QueueConfig, error::Result, storage::QueueStorage};

/// Background sweep returning stale claims to the Available pool.
///
/// Sweeps only its own logical queue; queues sharing a store may run
/// with different claim windows and each reaps on its own terms.
pub struct Reaper {
    storage: Arc<dyn QueueStorage>,
    queue_name: QueueName,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    cancellation: CancellationToken,
    handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Reaper {
    /// Creates a reaper for `queue_name`; the sweep starts on
    /// [`Reaper::start`].
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        queue_name: QueueName,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            queue_name,
            config,
            clock,
            cancellation: CancellationToken::new(),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Spawns the sweep loop.
    pub fn start(self: &Arc<Self>) {
        let reaper = self.clone();
        let handle = tokio::spawn(async move { reaper.run().await });
        *self.handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
        info!(period = ?self.config.reap_period(), "reaper started");
    }

    /// Stops the sweep loop and waits for it to exit.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "reaper task failed");
            }
        }
    }

    async fn run(&self) {
        let period = self.config.reap_period();
        loop {
            tokio::select! {
                () = self.cancellation.cancelled() => break,
                () = self.clock.sleep(period) => {},
            }

            // A failed sweep is retried on the next tick; stale claims
            // only wait longer, they are never lost.
            if let Err(e) = self.tick().await {
                warn!(error = %e, "reaper sweep failed");
            }
        }
        debug!("reaper stopped");
    }

    /// Runs one sweep. Exposed for deterministic testing.
    ///
    /// # Errors
    ///
    /// Returns error if the reap update fails.
    pub async fn tick(&self) -> Result<u64> {
        let period = self.config.reap_period();
        let cutoff = self.clock.now_utc()
            - chrono::Duration::from_std(period).unwrap_or(chrono::Duration::MAX);

        let reclaimed = self.storage.reap_stale(self.queue_name.clone(), cutoff).await?;
        if reclaimed > 0 {
            info!(reclaimed, %cutoff, "reset stale claims to available");
        }
        Ok(reclaimed)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}
