//! PostgreSQL persistence for the delivery core.
//!
//! Four tables back the system: `webhooks`, `delivery_jobs` (the queue),
//! `delivery_attempts` and `dead_letter_queue`, all keyed by webhook id.
//! Single-table operations live on the repositories; operations that must
//! change several tables atomically live on [`Storage`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub mod dead_letters;
pub mod delivery_attempts;
pub mod jobs;
pub mod schema;
pub mod webhooks;

use crate::{
    error::{CoreError, Result},
    models::{
        DeadLetterEntry, DeadLetterId, DeliveryAttempt, Job, Lease, RetryProfile, StalledRelease,
        StatsOverview, WebhookStatus,
    },
};

/// Dead-letter reason for jobs whose lease expired too many times.
pub const STALLED_REASON: &str = "Job stalled more than allowable limit";

/// Container for all repositories plus the cross-table transactions.
#[derive(Clone)]
pub struct Storage {
    /// Webhook rows.
    pub webhooks: Arc<webhooks::Repository>,

    /// Queue jobs.
    pub jobs: Arc<jobs::Repository>,

    /// Attempt log.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,

    /// Dead-letter entries.
    pub dead_letters: Arc<dead_letters::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance sharing one connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhooks: Arc::new(webhooks::Repository::new(pool.clone())),
            jobs: Arc::new(jobs::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies database connectivity with `SELECT 1`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }

    /// Records an attempt while holding `lease`.
    ///
    /// Returns `false` if the attempt number was already recorded for this
    /// generation.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is gone, or a database
    /// error.
    pub async fn record_attempt(&self, lease: &Lease, attempt: &DeliveryAttempt) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        self.jobs.lock_lease_in_tx(&mut tx, lease).await?;
        let inserted = self.delivery_attempts.record_in_tx(&mut tx, attempt).await?;
        tx.commit().await?;

        Ok(inserted)
    }

    /// Marks the leased webhook delivered and removes its job, atomically.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is gone, or
    /// `CoreError::InvalidTransition` if the webhook is not pending.
    pub async fn complete_delivery(&self, lease: &Lease, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.jobs.lock_lease_in_tx(&mut tx, lease).await?;
        self.webhooks
            .transition_in_tx(
                &mut tx,
                lease.webhook_id,
                WebhookStatus::Pending,
                WebhookStatus::Delivered,
                now,
            )
            .await?;
        self.jobs.ack_in_tx(&mut tx, lease).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Quarantines the leased webhook, atomically.
    ///
    /// In one transaction: the webhook moves to `failed`, a dead-letter
    /// entry is inserted and the job is deleted.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is gone, or
    /// `CoreError::InvalidTransition` if the webhook is not pending.
    pub async fn dead_letter(
        &self,
        lease: &Lease,
        reason: &str,
        final_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterEntry> {
        let entry = DeadLetterEntry {
            id: DeadLetterId(Uuid::new_v4()),
            webhook_id: lease.webhook_id,
            reason: reason.to_string(),
            final_error: final_error.map(str::to_string),
            moved_at: now,
        };

        let mut tx = self.pool.begin().await?;
        self.jobs.lock_lease_in_tx(&mut tx, lease).await?;
        self.webhooks
            .transition_in_tx(
                &mut tx,
                lease.webhook_id,
                WebhookStatus::Pending,
                WebhookStatus::Failed,
                now,
            )
            .await?;
        self.dead_letters.insert_in_tx(&mut tx, &entry).await?;
        self.jobs.ack_in_tx(&mut tx, lease).await?;
        tx.commit().await?;

        Ok(entry)
    }

    /// Resurrects a dead-lettered webhook with a fresh job, atomically.
    ///
    /// Deletes the entry, moves the webhook back to `pending`, removes any
    /// stale job row and inserts a new job with zero attempts in the next
    /// generation.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the entry does not exist and
    /// `CoreError::InvalidTransition` if the webhook is not `failed`.
    pub async fn resurrect(
        &self,
        id: DeadLetterId,
        profile: RetryProfile,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        let entry = self
            .dead_letters
            .take_in_tx(&mut tx, id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("dead letter entry {id}")))?;

        self.webhooks
            .transition_in_tx(
                &mut tx,
                entry.webhook_id,
                WebhookStatus::Failed,
                WebhookStatus::Pending,
                now,
            )
            .await?;
        self.jobs.delete_for_webhook_in_tx(&mut tx, entry.webhook_id).await?;
        let job = self
            .jobs
            .insert_in_tx(&mut tx, entry.webhook_id, profile, now)
            .await?
            .ok_or_else(|| {
                CoreError::ConstraintViolation(format!(
                    "job for webhook {} still present after cleanup",
                    entry.webhook_id
                ))
            })?;

        tx.commit().await?;

        Ok(job)
    }

    /// Sweeps leases that expired strictly before `now`, atomically.
    ///
    /// Every expired lease is released and its stall count incremented.
    /// Jobs whose count now exceeds `max_stalled_count` are not requeued:
    /// their webhook moves to `failed` with a [`STALLED_REASON`] entry and
    /// the job is deleted, in the same transaction as the release.
    ///
    /// # Errors
    ///
    /// Returns error if any statement fails; nothing is released then.
    pub async fn release_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled_count: i32,
    ) -> Result<StalledRelease> {
        let mut tx = self.pool.begin().await?;
        let stalled = self.jobs.release_stalled_in_tx(&mut tx, now).await?;

        let mut outcome = StalledRelease::default();
        for job in stalled {
            if job.stalled_count <= max_stalled_count {
                outcome.released.push(job.id);
                continue;
            }

            self.jobs.delete_for_webhook_in_tx(&mut tx, job.webhook_id).await?;
            match self
                .webhooks
                .transition_in_tx(
                    &mut tx,
                    job.webhook_id,
                    WebhookStatus::Pending,
                    WebhookStatus::Failed,
                    now,
                )
                .await
            {
                Ok(()) => {},
                // Already settled elsewhere; the orphaned job is just dropped.
                Err(CoreError::InvalidTransition { .. } | CoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }

            let entry = DeadLetterEntry {
                id: DeadLetterId(Uuid::new_v4()),
                webhook_id: job.webhook_id,
                reason: STALLED_REASON.to_string(),
                final_error: Some(format!("lease expired {} times", job.stalled_count)),
                moved_at: now,
            };
            self.dead_letters.insert_in_tx(&mut tx, &entry).await?;
            outcome.dead_lettered.push(entry);
        }

        tx.commit().await?;

        Ok(outcome)
    }

    /// Aggregates webhook, dead-letter and attempt statistics.
    ///
    /// # Errors
    ///
    /// Returns error if any query fails.
    pub async fn stats_overview(&self) -> Result<StatsOverview> {
        let by_status = self.webhooks.count_by_status().await?;
        let dlq_count = self.dead_letters.count().await?;
        let (total_attempts, avg_duration_ms) = self.delivery_attempts.summary().await?;

        Ok(StatsOverview {
            total_webhooks: by_status.values().sum(),
            by_status,
            dlq_count,
            total_attempts,
            avg_duration_ms,
        })
    }
}
