//! Worker pool management with structured concurrency.
//!
//! Spawns the delivery workers and the stalled sweeper, and stops them all
//! through one cancellation token with a bounded grace period.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    sweeper::StalledSweeper,
    worker::{DeliveryWorker, WorkerContext},
};

/// Supervised set of delivery workers plus the stalled sweeper.
pub struct WorkerPool {
    ctx: WorkerContext,
    instance_id: String,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    sweeper_handle: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool. Lease owners are named `<instance_id>-worker-<n>`.
    pub fn new(
        ctx: WorkerContext,
        instance_id: impl Into<String>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            instance_id: instance_id.into(),
            cancellation_token,
            worker_handles: Vec::new(),
            sweeper_handle: None,
        }
    }

    /// Spawns all configured workers and the sweeper.
    ///
    /// Returns immediately; tasks run until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the pool was already
    /// spawned.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if !self.worker_handles.is_empty() {
            return Err(DeliveryError::configuration("worker pool already running"));
        }

        let worker_count = self.ctx.config.worker_count;
        info!(worker_count, instance_id = %self.instance_id, "spawning delivery workers");
        self.ctx.stats.write().await.active_workers = worker_count;

        for worker_id in 0..worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                format!("{}-worker-{worker_id}", self.instance_id),
                self.ctx.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        let sweeper = StalledSweeper::new(
            self.ctx.queue.clone(),
            self.ctx.config.max_stalled_count,
            self.ctx.clock.clone(),
            self.ctx.stats.clone(),
            self.ctx.config.stalled_interval,
            self.cancellation_token.clone(),
        );
        self.sweeper_handle = Some(tokio::spawn(async move { sweeper.run().await }));

        info!(spawned_workers = self.worker_handles.len(), "delivery workers spawned");
        Ok(())
    }

    /// Gracefully shuts down all tasks, waiting for in-flight deliveries.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the tasks did not finish
    /// within `timeout`. Panicked workers are logged, not returned.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let worker_handles = std::mem::take(&mut self.worker_handles);
        let sweeper_handle = self.sweeper_handle.take();
        let stats = self.ctx.stats.clone();

        let shutdown_future = async move {
            let mut panics = 0_usize;

            for (worker_id, handle) in worker_handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        panics += 1;
                        let error =
                            DeliveryError::WorkerPanic { worker_id, error: join_error.to_string() };
                        error!(worker_id, error = %error, "worker task panicked");
                    },
                }
            }

            if let Some(handle) = sweeper_handle {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "stalled sweeper panicked");
                }
            }

            stats.write().await.active_workers = 0;
            panics
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(panics) => {
                if panics > 0 {
                    warn!(panics, "some workers panicked before shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some deliveries may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Returns whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
