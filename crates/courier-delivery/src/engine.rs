//! Webhook delivery engine.
//!
//! The engine wires the job queue, the storage adapter, the HTTP client and
//! the worker pool together, and is the entry point for the ingestion layer:
//! `enqueue` after a webhook row is created, `retry_from_dlq` to resurrect a
//! dead letter.
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ DeliveryEngine │──▶│ Worker Pool  │──▶│ HTTP Client │
//! └────────────────┘   └──────────────┘   └─────────────┘
//!        │                   │                   │
//!        ▼                   ▼                   ▼
//! ┌───────────────┐    ┌──────────────┐   ┌─────────────┐
//! │ delivery_jobs │    │ Stalled      │   │ Destination │
//! │ (leases)      │    │ Sweeper      │   │ Endpoints   │
//! └───────────────┘    └──────────────┘   └─────────────┘
//! ```

use std::sync::Arc;

use courier_core::{
    storage::Storage, Clock, DeadLetterEntry, DeadLetterId, DeadLetterPage, DeliveryAttempt, Job,
    QueueCounts, Signer, StalledRelease, StatsOverview, WebhookId,
};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::{
    client::DeliveryClient,
    error::{DeliveryError, Result},
    queue::{JobQueue, PostgresJobQueue},
    retry::RetryPolicy,
    storage::{DeliveryStorage, PostgresDeliveryStorage},
    sweeper::StalledSweeper,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats, WorkerContext},
    worker_pool::WorkerPool,
};

/// Main delivery engine coordinating webhook delivery workers.
pub struct DeliveryEngine {
    ctx: WorkerContext,
    instance_id: String,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine backed by PostgreSQL.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// inconsistent or the HTTP client cannot be built.
    pub fn new(
        pool: PgPool,
        config: DeliveryConfig,
        signer: Signer,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::new(pool));
        let queue = Arc::new(PostgresJobQueue::new(storage.clone(), clock.clone()));
        let delivery_storage = Arc::new(PostgresDeliveryStorage::new(storage, clock.clone()));

        Self::with_backends(queue, delivery_storage, config, signer, clock)
    }

    /// Creates an engine over arbitrary queue and storage backends.
    ///
    /// # Errors
    ///
    /// Same as [`DeliveryEngine::new`].
    pub fn with_backends(
        queue: Arc<dyn JobQueue>,
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        signer: Signer,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);

        let instance_id = Uuid::new_v4().simple().to_string()[..8].to_string();

        Ok(Self {
            ctx: WorkerContext {
                queue,
                storage,
                config,
                client,
                signer: Arc::new(signer),
                stats: Arc::new(RwLock::new(EngineStats::default())),
                clock,
            },
            instance_id,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
        })
    }

    /// Starts the worker pool and the stalled sweeper.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop
    /// gracefully, or drop the engine to cancel workers immediately.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if already started.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            instance_id = %self.instance_id,
            worker_count = self.ctx.config.worker_count,
            lease_seconds = self.ctx.config.lease_duration.as_secs(),
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.ctx.clone(),
            self.instance_id.clone(),
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Stops leasing new jobs and waits for in-flight deliveries, bounded by
    /// the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers did not finish in
    /// time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.ctx.config.shutdown_timeout).await
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
            Ok(())
        }
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.ctx.stats.read().await.clone()
    }

    /// Enqueues delivery of an existing pending webhook with the default
    /// retry policy. Enqueuing an already queued webhook is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the webhook row is missing or
    /// storage fails.
    pub async fn enqueue(&self, webhook_id: WebhookId) -> Result<Job> {
        self.enqueue_with_policy(webhook_id, &self.ctx.config.default_retry_policy).await
    }

    /// Enqueues delivery with an explicit retry policy.
    ///
    /// The policy is stored on the job, so later changes to the engine's
    /// default do not affect it.
    ///
    /// # Errors
    ///
    /// Same as [`DeliveryEngine::enqueue`], plus `ConfigurationError` for a
    /// policy that allows no attempts.
    pub async fn enqueue_with_policy(
        &self,
        webhook_id: WebhookId,
        policy: &RetryPolicy,
    ) -> Result<Job> {
        if policy.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }

        let job = self.ctx.queue.enqueue(webhook_id, policy.profile()).await?;
        info!(
            webhook_id = %webhook_id,
            job_id = %job.id,
            generation = job.generation,
            max_attempts = policy.max_attempts,
            "webhook enqueued for delivery"
        );
        Ok(job)
    }

    /// Resurrects a dead-lettered webhook: removes the entry, sets the
    /// webhook back to pending and enqueues a fresh job with the default
    /// policy, all in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the entry does not exist or
    /// storage fails. Nothing changes in that case.
    pub async fn retry_from_dlq(&self, dlq_id: DeadLetterId) -> Result<Job> {
        let profile = self.ctx.config.default_retry_policy.profile();
        let job = self.ctx.storage.retry_from_dlq(dlq_id, profile).await?;
        info!(
            dlq_id = %dlq_id,
            webhook_id = %job.webhook_id,
            generation = job.generation,
            "dead letter resurrected"
        );
        Ok(job)
    }

    /// Leases and processes at most one job on the caller's task.
    ///
    /// Useful for draining the queue deterministically without the pool.
    ///
    /// # Errors
    ///
    /// Same as [`DeliveryWorker::process_next`].
    pub async fn process_next(&self) -> Result<bool> {
        let worker = DeliveryWorker::new(
            0,
            format!("{}-inline", self.instance_id),
            self.ctx.clone(),
            self.cancellation_token.child_token(),
        );
        worker.process_next().await
    }

    /// Runs one stalled sweep immediately and reports which jobs were
    /// released and which went over the stall limit.
    ///
    /// # Errors
    ///
    /// Returns error if the queue fails.
    pub async fn sweep_stalled(&self) -> Result<StalledRelease> {
        StalledSweeper::new(
            self.ctx.queue.clone(),
            self.ctx.config.max_stalled_count,
            self.ctx.clock.clone(),
            self.ctx.stats.clone(),
            self.ctx.config.stalled_interval,
            self.cancellation_token.child_token(),
        )
        .sweep_once()
        .await
    }

    /// Job counts by queue state.
    ///
    /// # Errors
    ///
    /// Returns error if the queue fails.
    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        Ok(self.ctx.queue.counts().await?)
    }

    /// Aggregates over persisted webhooks, attempts and dead letters.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn stats_overview(&self) -> Result<StatsOverview> {
        Ok(self.ctx.storage.stats_overview().await?)
    }

    /// Dead-letter entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn list_dead_letters(&self, limit: i64, offset: i64) -> Result<DeadLetterPage> {
        Ok(self.ctx.storage.list_dead_letters(limit, offset).await?)
    }

    /// Dead-letter entry for a webhook, if it is dead-lettered.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn find_dead_letter(&self, webhook_id: WebhookId) -> Result<Option<DeadLetterEntry>> {
        Ok(self.ctx.storage.find_dead_letter(webhook_id).await?)
    }

    /// Attempt history for a webhook, ordered by generation then attempt
    /// number.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn delivery_attempts(&self, webhook_id: WebhookId) -> Result<Vec<DeliveryAttempt>> {
        Ok(self.ctx.storage.find_attempts(webhook_id).await?)
    }

    /// Probes the storage backend.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the check query fails.
    pub async fn health_check(&self) -> Result<()> {
        Ok(self.ctx.storage.health_check().await?)
    }

    /// Engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.ctx.config
    }

    /// Whether `start` has been called.
    pub fn is_running(&self) -> bool {
        self.worker_pool.is_some()
    }
}
