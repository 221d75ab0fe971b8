//! Repository for the durable job queue table.
//!
//! Jobs are leased with `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! block on, or double-claim, the same row. Every mutation made on behalf of
//! a worker is conditional on the lease token and generation the worker was
//! handed; a zero-row result means the lease is gone.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{Job, JobId, Lease, QueueCounts, RetryProfile, WebhookId},
};

/// A job whose expired lease was released by the sweep.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StalledJob {
    /// Released job.
    pub id: JobId,
    /// Webhook the job delivers.
    pub webhook_id: WebhookId,
    /// Stall count after this release.
    pub stalled_count: i32,
}

/// Repository for `delivery_jobs`.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Enqueues a job for `webhook_id`, or returns the existing one.
    ///
    /// The job id is derived from the webhook id, so a second call while a
    /// job exists is a no-op that returns the stored row unchanged. New jobs
    /// are visible immediately and start a new generation.
    ///
    /// # Errors
    ///
    /// Returns error if the insert or lookup fails.
    pub async fn enqueue(
        &self,
        webhook_id: WebhookId,
        profile: RetryProfile,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let job = match self.insert_impl(&mut *tx, webhook_id, profile, now).await? {
            Some(job) => job,
            None => self
                .find_by_id_impl(&mut *tx, &JobId::for_webhook(webhook_id))
                .await?
                .ok_or_else(|| {
                    CoreError::Database(format!("job for webhook {webhook_id} vanished during enqueue"))
                })?,
        };
        tx.commit().await?;

        Ok(job)
    }

    /// Inserts a fresh job within a transaction.
    ///
    /// Returns `None` if a job for the webhook already exists.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        webhook_id: WebhookId,
        profile: RetryProfile,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.insert_impl(&mut **tx, webhook_id, profile, now).await
    }

    /// Private helper for inserting jobs with generic executor.
    ///
    /// The generation is one past the highest generation recorded in the
    /// attempt log for the webhook, so resurrected jobs never share a
    /// generation with attempts from an earlier cycle.
    async fn insert_impl<'e, E>(
        &self,
        executor: E,
        webhook_id: WebhookId,
        profile: RetryProfile,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO delivery_jobs (
                id, webhook_id, generation, attempts_made, max_attempts,
                backoff_strategy, base_delay_ms, next_visible_at, created_at
            ) VALUES (
                $1, $2,
                (SELECT COALESCE(MAX(generation), 0) + 1 FROM delivery_attempts WHERE webhook_id = $2),
                0, $3, $4, $5, $6, $6
            )
            ON CONFLICT (id) DO NOTHING
            RETURNING id, webhook_id, generation, attempts_made, max_attempts,
                      backoff_strategy, base_delay_ms, next_visible_at,
                      lease_owner, lease_token, lease_expires_at, stalled_count, enqueued_seq, created_at
            "#,
        )
        .bind(JobId::for_webhook(webhook_id))
        .bind(webhook_id)
        .bind(profile.max_attempts)
        .bind(profile.backoff_strategy.as_str())
        .bind(profile.base_delay_ms)
        .bind(now)
        .fetch_optional(executor)
        .await?;

        Ok(job)
    }

    /// Leases the earliest visible, unleased job.
    ///
    /// Orders by `next_visible_at` then insertion order. The select and the
    /// update run in one transaction with `SKIP LOCKED`, so two callers can
    /// never receive the same job.
    ///
    /// # Errors
    ///
    /// Returns error if database transaction fails.
    pub async fn lease(
        &self,
        owner: &str,
        lease_duration: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let mut tx = self.pool.begin().await?;

        let job_id: Option<JobId> = sqlx::query_scalar(
            r#"
            SELECT id FROM delivery_jobs
            WHERE lease_token IS NULL
              AND next_visible_at <= $1
            ORDER BY next_visible_at ASC, enqueued_seq ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE delivery_jobs
            SET lease_owner = $2, lease_token = $3, lease_expires_at = $4
            WHERE id = $1
            RETURNING id, webhook_id, generation, attempts_made, max_attempts,
                      backoff_strategy, base_delay_ms, next_visible_at,
                      lease_owner, lease_token, lease_expires_at, stalled_count, enqueued_seq, created_at
            "#,
        )
        .bind(&job_id)
        .bind(owner)
        .bind(Uuid::new_v4())
        .bind(now + lease_duration)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(job.lease())
    }

    /// Locks the job row if `lease` is still current.
    ///
    /// Used as the first statement of every transaction that acts on a
    /// lease, so the sweep cannot release the row mid-transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the row no longer carries the lease.
    pub async fn lock_lease_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        lease: &Lease,
    ) -> Result<()> {
        let held: Option<JobId> = sqlx::query_scalar(
            r#"
            SELECT id FROM delivery_jobs
            WHERE id = $1 AND lease_token = $2 AND generation = $3
            FOR UPDATE
            "#,
        )
        .bind(&lease.job_id)
        .bind(lease.token)
        .bind(lease.generation)
        .fetch_optional(&mut **tx)
        .await?;

        match held {
            Some(_) => Ok(()),
            None => Err(CoreError::LeaseLost { job_id: lease.job_id.clone() }),
        }
    }

    /// Deletes the job held by `lease`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is no longer current.
    pub async fn ack(&self, lease: &Lease) -> Result<()> {
        self.ack_impl(&*self.pool, lease).await
    }

    /// Deletes the job held by `lease` within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is no longer current.
    pub async fn ack_in_tx(&self, tx: &mut Transaction<'_, Postgres>, lease: &Lease) -> Result<()> {
        self.ack_impl(&mut **tx, lease).await
    }

    /// Private helper for acking with generic executor.
    async fn ack_impl<'e, E>(&self, executor: E, lease: &Lease) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_jobs
            WHERE id = $1 AND lease_token = $2 AND generation = $3
            "#,
        )
        .bind(&lease.job_id)
        .bind(lease.token)
        .bind(lease.generation)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::LeaseLost { job_id: lease.job_id.clone() });
        }
        Ok(())
    }

    /// Returns a leased job to the queue after a retryable failure.
    ///
    /// Increments `attempts_made`, hides the job until `visible_at` and
    /// clears the lease.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is no longer current.
    pub async fn nack(&self, lease: &Lease, visible_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET attempts_made = attempts_made + 1,
                next_visible_at = $4,
                lease_owner = NULL,
                lease_token = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND lease_token = $2 AND generation = $3
            "#,
        )
        .bind(&lease.job_id)
        .bind(lease.token)
        .bind(lease.generation)
        .bind(visible_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::LeaseLost { job_id: lease.job_id.clone() });
        }
        Ok(())
    }

    /// Releases leases that expired strictly before `now`, within a
    /// transaction.
    ///
    /// Each released job has its `stalled_count` incremented, keeps its
    /// `attempts_made` and becomes visible again immediately. Returned rows
    /// are ordered by job id.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn release_stalled_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StalledJob>> {
        let mut released: Vec<StalledJob> = sqlx::query_as(
            r#"
            UPDATE delivery_jobs
            SET lease_owner = NULL,
                lease_token = NULL,
                lease_expires_at = NULL,
                stalled_count = stalled_count + 1
            WHERE lease_token IS NOT NULL
              AND lease_expires_at < $1
            RETURNING id, webhook_id, stalled_count
            "#,
        )
        .bind(now)
        .fetch_all(&mut **tx)
        .await?;

        released.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(released)
    }

    /// Deletes any job for `webhook_id` within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn delete_for_webhook_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        webhook_id: WebhookId,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM delivery_jobs WHERE webhook_id = $1")
            .bind(webhook_id)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }

    /// Finds a job by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.find_by_id_impl(&*self.pool, job_id).await
    }

    /// Private helper for finding jobs with generic executor.
    async fn find_by_id_impl<'e, E>(&self, executor: E, job_id: &JobId) -> Result<Option<Job>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, webhook_id, generation, attempts_made, max_attempts,
                   backoff_strategy, base_delay_ms, next_visible_at,
                   lease_owner, lease_token, lease_expires_at, stalled_count, enqueued_seq, created_at
            FROM delivery_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

        Ok(job)
    }

    /// Counts jobs by queue state.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts> {
        let (waiting, active, delayed): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE lease_token IS NULL AND next_visible_at <= $1),
                COUNT(*) FILTER (WHERE lease_token IS NOT NULL),
                COUNT(*) FILTER (WHERE lease_token IS NULL AND next_visible_at > $1)
            FROM delivery_jobs
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(QueueCounts { waiting, active, delayed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
