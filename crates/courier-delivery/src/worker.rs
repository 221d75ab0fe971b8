//! Delivery workers.
//!
//! A worker leases one job, delivers it and settles it before leasing the
//! next. Workers share nothing but the [`WorkerContext`]; mutual exclusion
//! comes entirely from the queue lease.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use courier_core::{
    signing::canonical_json, Clock, DeliveryAttempt, Lease, Signer, Webhook, WebhookStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{ClientConfig, DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
    queue::JobQueue,
    retry::{self, RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Pause after a failed poll before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// How long an idle worker waits before polling the queue again.
    pub poll_interval: Duration,

    /// How long a lease lasts before the sweeper may release it.
    pub lease_duration: Duration,

    /// How often the stalled sweeper runs.
    pub stalled_interval: Duration,

    /// Lease expiries a job may survive. One more and it is dead-lettered.
    pub max_stalled_count: u32,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Policy for jobs enqueued without an explicit one.
    pub default_retry_policy: RetryPolicy,

    /// Maximum time to wait for workers to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(crate::DEFAULT_LEASE_SECONDS),
            stalled_interval: Duration::from_secs(crate::DEFAULT_STALLED_INTERVAL_SECONDS),
            max_stalled_count: crate::DEFAULT_MAX_STALLED_COUNT,
            client_config: ClientConfig::default(),
            default_retry_policy: RetryPolicy::standard(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` when there are no workers,
    /// the retry policy allows no attempts, the sweep interval is zero, or the
    /// lease does not outlast the request timeout. A lease shorter than the
    /// timeout would let the sweeper release jobs that live workers still hold.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.default_retry_policy.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if self.stalled_interval.is_zero() {
            return Err(DeliveryError::configuration("stalled_interval must be positive"));
        }
        if self.lease_duration <= self.client_config.timeout {
            return Err(DeliveryError::configuration(format!(
                "lease_duration ({:?}) must exceed the request timeout ({:?})",
                self.lease_duration, self.client_config.timeout
            )));
        }
        Ok(())
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of running delivery workers.
    pub active_workers: usize,
    /// Leases taken and settled since startup.
    pub jobs_processed: u64,
    /// Webhooks delivered.
    pub successful_deliveries: u64,
    /// Failed attempts that were scheduled for retry.
    pub retries_scheduled: u64,
    /// Webhooks moved to the dead-letter queue.
    pub dead_lettered: u64,
    /// Jobs dropped because their webhook was missing or already settled.
    pub dropped_jobs: u64,
    /// Leases found stale while a worker was still acting on them.
    pub leases_lost: u64,
    /// Leases released by the stalled sweeper.
    pub stalled_released: u64,
    /// Jobs dead-lettered by the sweeper for stalling too often.
    pub stalled_failed: u64,
    /// Attempts settled from the ledger instead of being sent again.
    pub replayed_attempts: u64,
    /// Deliveries currently in flight.
    pub in_flight_deliveries: u64,
}

/// Everything a worker needs, shared by the whole pool.
#[derive(Clone)]
pub struct WorkerContext {
    /// Job queue.
    pub queue: Arc<dyn JobQueue>,
    /// Webhooks, attempt log and dead letters.
    pub storage: Arc<dyn DeliveryStorage>,
    /// Engine configuration.
    pub config: DeliveryConfig,
    /// HTTP client.
    pub client: Arc<DeliveryClient>,
    /// Signs payloads that have no stored signature.
    pub signer: Arc<Signer>,
    /// Shared counters.
    pub stats: Arc<RwLock<EngineStats>>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Individual worker that processes webhook deliveries.
pub struct DeliveryWorker {
    id: usize,
    owner: String,
    ctx: WorkerContext,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Creates a worker. `owner` is recorded on every lease it takes.
    pub fn new(
        id: usize,
        owner: impl Into<String>,
        ctx: WorkerContext,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, owner: owner.into(), ctx, cancellation_token }
    }

    /// Lease owner name of this worker.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Main worker loop: leases and processes jobs until cancelled.
    ///
    /// An in-flight delivery is always finished before the loop checks for
    /// cancellation again.
    ///
    /// # Errors
    ///
    /// Processing errors are logged and retried, so this currently only
    /// returns `Ok`.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, owner = %self.owner, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_next().await {
                Ok(true) => {},
                Ok(false) => {
                    tokio::select! {
                        () = self.ctx.clock.sleep(self.ctx.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "job processing failed");
                    tokio::select! {
                        () = self.ctx.clock.sleep(ERROR_BACKOFF) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Leases and processes at most one job.
    ///
    /// Returns `false` when no job was visible. A lease lost mid-flight is
    /// logged and counts as processed.
    ///
    /// # Errors
    ///
    /// Returns error if the queue or storage fails. The job's lease is left
    /// to expire so the stalled sweeper hands it out again.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(lease) =
            self.ctx.queue.lease(&self.owner, self.ctx.config.lease_duration).await?
        else {
            return Ok(false);
        };

        self.ctx.stats.write().await.in_flight_deliveries += 1;
        let result = self.process_lease(&lease).await;
        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight_deliveries -= 1;
            stats.jobs_processed += 1;
            if matches!(result, Err(ref e) if e.is_lease_lost()) {
                stats.leases_lost += 1;
            }
        }

        match result {
            Ok(()) => Ok(true),
            Err(error) if error.is_lease_lost() => {
                warn!(
                    worker_id = self.id,
                    job_id = %lease.job_id,
                    webhook_id = %lease.webhook_id,
                    "lease lost before the job was settled, discarding result"
                );
                Ok(true)
            },
            Err(error) => Err(error),
        }
    }

    async fn process_lease(&self, lease: &Lease) -> Result<()> {
        let Some(webhook) = self.ctx.storage.find_webhook(lease.webhook_id).await? else {
            warn!(
                worker_id = self.id,
                job_id = %lease.job_id,
                webhook_id = %lease.webhook_id,
                "{}, dropping job",
                DeliveryError::WebhookNotFound { webhook_id: lease.webhook_id }
            );
            self.ctx.queue.ack(lease).await?;
            self.ctx.stats.write().await.dropped_jobs += 1;
            return Ok(());
        };

        if webhook.status != WebhookStatus::Pending {
            info!(
                worker_id = self.id,
                webhook_id = %webhook.id,
                status = %webhook.status,
                "webhook already settled, dropping job"
            );
            self.ctx.queue.ack(lease).await?;
            self.ctx.stats.write().await.dropped_jobs += 1;
            return Ok(());
        }

        let attempt_number = lease.attempt_number();
        let recorded =
            self.ctx.storage.find_attempt(webhook.id, lease.generation, attempt_number).await?;

        let (attempt, failure) = match recorded {
            Some(attempt) => {
                info!(
                    worker_id = self.id,
                    webhook_id = %webhook.id,
                    job_id = %lease.job_id,
                    attempt_number,
                    response_status = ?attempt.response_status,
                    "attempt already recorded by an earlier lease, settling from its outcome"
                );
                self.ctx.stats.write().await.replayed_attempts += 1;
                let failure = retry::recorded_failure(&attempt);
                (attempt, failure)
            },
            None => self.attempt_delivery(&webhook, lease).await?,
        };

        self.settle(lease, &attempt, failure).await
    }

    /// Sends attempt `lease.attempt_number()` and records it in the ledger.
    ///
    /// If another lease recorded the same attempt first, the recorded row
    /// wins and its outcome is returned instead.
    async fn attempt_delivery(
        &self,
        webhook: &Webhook,
        lease: &Lease,
    ) -> Result<(DeliveryAttempt, Option<DeliveryError>)> {
        let attempt_number = lease.attempt_number();
        let signature =
            webhook.signature.clone().unwrap_or_else(|| self.ctx.signer.sign(&webhook.payload.0));
        let request = DeliveryRequest {
            attempt_id: Uuid::new_v4(),
            webhook_id: webhook.id,
            url: webhook.target_url.clone(),
            body: Bytes::from(canonical_json(&webhook.payload.0)),
            signature,
            headers: webhook.header_overrides(),
            attempt_number,
        };

        debug!(
            worker_id = self.id,
            webhook_id = %webhook.id,
            job_id = %lease.job_id,
            attempt_number,
            "attempting webhook delivery"
        );

        let started = self.ctx.clock.now();
        let attempt_id = request.attempt_id;
        let outcome = self.ctx.client.deliver(request).await;
        let duration = match &outcome {
            Ok(response) => response.duration,
            Err(_) => self.ctx.clock.now().saturating_duration_since(started),
        };

        let failure = retry::failure(&outcome);
        let attempt = DeliveryAttempt {
            id: attempt_id,
            webhook_id: webhook.id,
            generation: lease.generation,
            attempt_number,
            response_status: outcome.as_ref().ok().map(|r| i32::from(r.status_code)),
            response_body: outcome.as_ref().ok().map(|r| r.body.clone()),
            error_message: failure.as_ref().map(ToString::to_string),
            duration_ms: i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
            attempted_at: self.ctx.clock.now_utc(),
        };

        if self.ctx.storage.record_attempt(lease, attempt.clone()).await? {
            return Ok((attempt, failure));
        }

        let winner =
            self.ctx.storage.find_attempt(webhook.id, lease.generation, attempt_number).await?;
        match winner {
            Some(recorded) => {
                warn!(
                    worker_id = self.id,
                    webhook_id = %webhook.id,
                    attempt_number,
                    "attempt was recorded concurrently, settling from the recorded outcome"
                );
                let failure = retry::recorded_failure(&recorded);
                Ok((recorded, failure))
            },
            None => Ok((attempt, failure)),
        }
    }

    /// Acts on the outcome of the attempt that `lease` is responsible for.
    async fn settle(
        &self,
        lease: &Lease,
        attempt: &DeliveryAttempt,
        failure: Option<DeliveryError>,
    ) -> Result<()> {
        let policy = RetryPolicy::from_profile(
            lease.profile,
            self.ctx.config.default_retry_policy.max_delay,
        );
        let attempts_made = u32::try_from(lease.attempts_made).unwrap_or(0);
        let classification = retry::classify_failure(failure.as_ref());

        match policy.decide(attempts_made, classification, failure.as_ref()) {
            RetryDecision::Deliver => {
                self.ctx.storage.mark_delivered(lease).await?;
                self.ctx.stats.write().await.successful_deliveries += 1;
                info!(
                    worker_id = self.id,
                    webhook_id = %lease.webhook_id,
                    attempt_number = attempt.attempt_number,
                    status_code = attempt.response_status.unwrap_or_default(),
                    duration_ms = attempt.duration_ms,
                    "webhook delivered"
                );
            },
            RetryDecision::Retry { delay } => {
                self.ctx.queue.nack(lease, delay).await?;
                self.ctx.stats.write().await.retries_scheduled += 1;
                warn!(
                    worker_id = self.id,
                    webhook_id = %lease.webhook_id,
                    attempt_number = attempt.attempt_number,
                    delay_ms = delay.as_millis(),
                    error = attempt.error_message.as_deref().unwrap_or_default(),
                    "delivery failed, retry scheduled"
                );
            },
            RetryDecision::GiveUp { reason } => {
                let entry = self
                    .ctx
                    .storage
                    .move_to_dead_letter(lease, reason, attempt.error_message.clone())
                    .await?;
                self.ctx.stats.write().await.dead_lettered += 1;
                warn!(
                    worker_id = self.id,
                    webhook_id = %lease.webhook_id,
                    dlq_id = %entry.id,
                    attempt_number = attempt.attempt_number,
                    reason = %entry.reason,
                    "webhook moved to dead-letter queue"
                );
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        DeliveryConfig::default().validate().unwrap();
    }

    #[test]
    fn lease_must_outlast_request_timeout() {
        let config = DeliveryConfig {
            lease_duration: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DeliveryError::ConfigurationError { .. })));
    }

    #[test]
    fn zero_workers_rejected() {
        let config = DeliveryConfig { worker_count: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = DeliveryConfig::default();
        config.default_retry_policy.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
