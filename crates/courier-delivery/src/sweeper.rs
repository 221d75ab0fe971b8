//! Periodic release of stalled leases.

use std::{sync::Arc, time::Duration};

use courier_core::StalledRelease;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{error::Result, queue::JobQueue, worker::EngineStats};

/// Background task that makes jobs of crashed workers visible again.
///
/// Only leases whose expiry is strictly in the past are released, so a live
/// worker inside its lease window is never interrupted. A job whose lease
/// expires more than `max_stalled_count` times is dead-lettered instead.
pub(crate) struct StalledSweeper {
    queue: Arc<dyn JobQueue>,
    max_stalled_count: u32,
    clock: Arc<dyn courier_core::Clock>,
    stats: Arc<RwLock<EngineStats>>,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl StalledSweeper {
    pub(crate) fn new(
        queue: Arc<dyn JobQueue>,
        max_stalled_count: u32,
        clock: Arc<dyn courier_core::Clock>,
        stats: Arc<RwLock<EngineStats>>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { queue, max_stalled_count, clock, stats, interval, cancellation_token }
    }

    pub(crate) async fn run(&self) {
        info!(interval_ms = self.interval.as_millis(), "stalled sweeper starting");

        loop {
            tokio::select! {
                () = self.clock.sleep(self.interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }

            if let Err(error) = self.sweep_once().await {
                error!(error = %error, "stalled sweep failed");
            }
        }

        info!("stalled sweeper stopped");
    }

    /// Releases expired leases and dead-letters jobs over the stall limit.
    pub(crate) async fn sweep_once(&self) -> Result<StalledRelease> {
        let swept = self.queue.release_stalled(self.max_stalled_count).await?;

        if !swept.released.is_empty() {
            warn!(
                released = swept.released.len(),
                job_ids = ?swept.released.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "released stalled leases"
            );
        }
        for entry in &swept.dead_lettered {
            error!(
                webhook_id = %entry.webhook_id,
                dlq_id = %entry.id,
                max_stalled_count = self.max_stalled_count,
                reason = %entry.reason,
                "webhook moved to dead-letter queue"
            );
        }
        {
            let mut stats = self.stats.write().await;
            stats.stalled_released += swept.released.len() as u64;
            stats.stalled_failed += swept.dead_lettered.len() as u64;
            stats.dead_lettered += swept.dead_lettered.len() as u64;
        }

        let counts = self.queue.counts().await?;
        debug!(
            waiting = counts.waiting,
            active = counts.active,
            delayed = counts.delayed,
            "queue counts"
        );

        Ok(swept)
    }
}
