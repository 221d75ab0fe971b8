//! Job queue abstraction.
//!
//! The queue is the only coordination point between workers: a lease is an
//! exclusive, time-bounded claim and every later operation on the job must
//! present it. [`PostgresJobQueue`] backs the trait with row-level locking;
//! [`crate::storage::memory::InMemoryStore`] implements it for tests.

use std::{sync::Arc, time::Duration};

use courier_core::{
    storage::Storage, Clock, CoreError, Job, Lease, QueueCounts, RetryProfile, StalledRelease,
    WebhookId,
};

use crate::storage::StorageFuture;

/// Durable queue of delivery jobs, one per webhook.
pub trait JobQueue: Send + Sync + 'static {
    /// Enqueues a job for the webhook, or returns the existing one unchanged.
    fn enqueue(&self, webhook_id: WebhookId, profile: RetryProfile) -> StorageFuture<'_, Job>;

    /// Leases the earliest visible, unleased job for `owner`.
    ///
    /// Never hands the same job to two concurrent callers.
    fn lease(&self, owner: &str, lease_duration: Duration) -> StorageFuture<'_, Option<Lease>>;

    /// Deletes the leased job.
    fn ack(&self, lease: &Lease) -> StorageFuture<'_, ()>;

    /// Counts an attempt, releases the lease and hides the job for `delay`.
    fn nack(&self, lease: &Lease, delay: Duration) -> StorageFuture<'_, ()>;

    /// Releases leases whose expiry is strictly in the past.
    ///
    /// A job whose lease has now expired more than `max_stalled_count`
    /// times is dead-lettered instead of requeued, in the same atomic step.
    fn release_stalled(&self, max_stalled_count: u32) -> StorageFuture<'_, StalledRelease>;

    /// Job counts by queue state.
    fn counts(&self) -> StorageFuture<'_, QueueCounts>;
}

/// Converts a lease or backoff duration for timestamp arithmetic.
pub(crate) fn chrono_duration(duration: Duration) -> courier_core::Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| CoreError::InvalidInput(format!("duration {duration:?} out of range: {e}")))
}

/// PostgreSQL-backed queue over the `delivery_jobs` table.
pub struct PostgresJobQueue {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresJobQueue {
    /// Creates a queue over the given storage.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl JobQueue for PostgresJobQueue {
    fn enqueue(&self, webhook_id: WebhookId, profile: RetryProfile) -> StorageFuture<'_, Job> {
        let now = self.clock.now_utc();
        Box::pin(async move { self.storage.jobs.enqueue(webhook_id, profile, now).await })
    }

    fn lease(&self, owner: &str, lease_duration: Duration) -> StorageFuture<'_, Option<Lease>> {
        let owner = owner.to_string();
        let now = self.clock.now_utc();
        Box::pin(async move {
            let lease_duration = chrono_duration(lease_duration)?;
            self.storage.jobs.lease(&owner, lease_duration, now).await
        })
    }

    fn ack(&self, lease: &Lease) -> StorageFuture<'_, ()> {
        let lease = lease.clone();
        Box::pin(async move { self.storage.jobs.ack(&lease).await })
    }

    fn nack(&self, lease: &Lease, delay: Duration) -> StorageFuture<'_, ()> {
        let lease = lease.clone();
        let now = self.clock.now_utc();
        Box::pin(async move {
            let visible_at = now + chrono_duration(delay)?;
            self.storage.jobs.nack(&lease, visible_at).await
        })
    }

    fn release_stalled(&self, max_stalled_count: u32) -> StorageFuture<'_, StalledRelease> {
        let now = self.clock.now_utc();
        let limit = i32::try_from(max_stalled_count).unwrap_or(i32::MAX);
        Box::pin(async move { self.storage.release_stalled(now, limit).await })
    }

    fn counts(&self) -> StorageFuture<'_, QueueCounts> {
        let now = self.clock.now_utc();
        Box::pin(async move { self.storage.jobs.counts(now).await })
    }
}
