//! Storage abstraction layer for the delivery engine.
//!
//! Workers reach webhooks, the attempt log and the dead-letter queue through
//! [`DeliveryStorage`], so the delivery flow runs unchanged against
//! PostgreSQL ([`PostgresDeliveryStorage`]) or the in-memory backend in
//! [`memory`]. Operations that act on behalf of a leased job take the
//! [`Lease`] and fail with `CoreError::LeaseLost` once it is stale.

use std::{future::Future, pin::Pin, sync::Arc};

use courier_core::{
    error::Result, storage::Storage, Clock, DeadLetterEntry, DeadLetterId, DeadLetterPage,
    DeliveryAttempt, Job, Lease, RetryProfile, StatsOverview, Webhook, WebhookId,
};

/// Boxed future returned by the storage and queue traits.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence operations required by the delivery engine.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Loads a webhook by id.
    fn find_webhook(&self, id: WebhookId) -> StorageFuture<'_, Option<Webhook>>;

    /// Appends an attempt while holding `lease`.
    ///
    /// Returns `false` if this attempt number was already recorded for the
    /// lease's generation; the log is left untouched in that case.
    fn record_attempt(&self, lease: &Lease, attempt: DeliveryAttempt) -> StorageFuture<'_, bool>;

    /// Attempt recorded under `(webhook_id, generation, attempt_number)`.
    ///
    /// Workers check this before sending, so an attempt that was recorded
    /// but never settled is not sent a second time.
    fn find_attempt(
        &self,
        webhook_id: WebhookId,
        generation: i32,
        attempt_number: i32,
    ) -> StorageFuture<'_, Option<DeliveryAttempt>>;

    /// Marks the webhook delivered and removes its job in one step.
    fn mark_delivered(&self, lease: &Lease) -> StorageFuture<'_, ()>;

    /// Marks the webhook failed, inserts a dead-letter entry and removes the
    /// job in one step.
    fn move_to_dead_letter(
        &self,
        lease: &Lease,
        reason: String,
        final_error: Option<String>,
    ) -> StorageFuture<'_, DeadLetterEntry>;

    /// Deletes a dead-letter entry, resets the webhook to pending and
    /// enqueues a fresh job in the next generation, in one step.
    fn retry_from_dlq(&self, id: DeadLetterId, profile: RetryProfile) -> StorageFuture<'_, Job>;

    /// Attempts for a webhook, ordered by generation then attempt number.
    fn find_attempts(&self, webhook_id: WebhookId) -> StorageFuture<'_, Vec<DeliveryAttempt>>;

    /// Dead-letter entry for a webhook, if it is quarantined.
    fn find_dead_letter(&self, webhook_id: WebhookId) -> StorageFuture<'_, Option<DeadLetterEntry>>;

    /// Page of dead-letter entries, newest first.
    fn list_dead_letters(&self, limit: i64, offset: i64) -> StorageFuture<'_, DeadLetterPage>;

    /// Aggregate statistics over persisted state.
    fn stats_overview(&self) -> StorageFuture<'_, StatsOverview>;

    /// Checks that the backend is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// Production storage implementation using PostgreSQL.
///
/// Delegates to the repositories and transactional operations of
/// [`courier_core::storage::Storage`], stamping writes with the engine clock.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_webhook(&self, id: WebhookId) -> StorageFuture<'_, Option<Webhook>> {
        Box::pin(async move { self.storage.webhooks.find_by_id(id).await })
    }

    fn record_attempt(&self, lease: &Lease, attempt: DeliveryAttempt) -> StorageFuture<'_, bool> {
        let lease = lease.clone();
        Box::pin(async move { self.storage.record_attempt(&lease, &attempt).await })
    }

    fn find_attempt(
        &self,
        webhook_id: WebhookId,
        generation: i32,
        attempt_number: i32,
    ) -> StorageFuture<'_, Option<DeliveryAttempt>> {
        Box::pin(async move {
            self.storage.delivery_attempts.find_one(webhook_id, generation, attempt_number).await
        })
    }

    fn mark_delivered(&self, lease: &Lease) -> StorageFuture<'_, ()> {
        let lease = lease.clone();
        let now = self.clock.now_utc();
        Box::pin(async move { self.storage.complete_delivery(&lease, now).await })
    }

    fn move_to_dead_letter(
        &self,
        lease: &Lease,
        reason: String,
        final_error: Option<String>,
    ) -> StorageFuture<'_, DeadLetterEntry> {
        let lease = lease.clone();
        let now = self.clock.now_utc();
        Box::pin(async move {
            self.storage.dead_letter(&lease, &reason, final_error.as_deref(), now).await
        })
    }

    fn retry_from_dlq(&self, id: DeadLetterId, profile: RetryProfile) -> StorageFuture<'_, Job> {
        let now = self.clock.now_utc();
        Box::pin(async move { self.storage.resurrect(id, profile, now).await })
    }

    fn find_attempts(&self, webhook_id: WebhookId) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(async move { self.storage.delivery_attempts.find_by_webhook(webhook_id).await })
    }

    fn find_dead_letter(&self, webhook_id: WebhookId) -> StorageFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(async move { self.storage.dead_letters.find_by_webhook(webhook_id).await })
    }

    fn list_dead_letters(&self, limit: i64, offset: i64) -> StorageFuture<'_, DeadLetterPage> {
        Box::pin(async move { self.storage.dead_letters.list(limit, offset).await })
    }

    fn stats_overview(&self) -> StorageFuture<'_, StatsOverview> {
        Box::pin(async move { self.storage.stats_overview().await })
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.health_check().await })
    }
}

pub mod memory {
    //! In-memory backend for tests.
    //!
    //! One store implements both [`JobQueue`] and [`DeliveryStorage`] over a
    //! single mutex, so every multi-table operation is atomic the same way
    //! the PostgreSQL transactions are. Time comes from the injected clock.
    //! Failures can be injected to exercise the persistence-error path.

    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        storage::STALLED_REASON,
        Clock, DeadLetterEntry, DeadLetterId, DeadLetterPage, DeliveryAttempt, Job, JobId, Lease,
        QueueCounts, RetryProfile, StalledRelease, StatsOverview, Webhook, WebhookId, WebhookStatus,
    };
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use super::{DeliveryStorage, StorageFuture};
    use crate::queue::{chrono_duration, JobQueue};

    #[derive(Default)]
    struct State {
        webhooks: HashMap<WebhookId, Webhook>,
        jobs: HashMap<WebhookId, Job>,
        attempts: Vec<DeliveryAttempt>,
        dead_letters: Vec<DeadLetterEntry>,
        next_seq: i64,
        fail_next_lease: Option<String>,
        fail_next_write: Option<String>,
    }

    impl State {
        fn injected_write_failure(&mut self) -> Result<()> {
            match self.fail_next_write.take() {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }

        fn check_lease(&self, lease: &Lease) -> Result<()> {
            let held = self.jobs.get(&lease.webhook_id).is_some_and(|job| {
                job.id == lease.job_id
                    && job.lease_token == Some(lease.token)
                    && job.generation == lease.generation
            });

            if held {
                Ok(())
            } else {
                Err(CoreError::LeaseLost { job_id: lease.job_id.clone() })
            }
        }

        fn transition(
            &mut self,
            id: WebhookId,
            from: WebhookStatus,
            to: WebhookStatus,
            now: DateTime<Utc>,
        ) -> Result<()> {
            from.transition_to(to)?;
            let webhook = self
                .webhooks
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("webhook {id}")))?;
            if webhook.status != from {
                return Err(CoreError::InvalidTransition { from: webhook.status, to });
            }
            webhook.status = to;
            webhook.updated_at = now;
            Ok(())
        }

        fn insert_job(&mut self, webhook_id: WebhookId, profile: RetryProfile, now: DateTime<Utc>) -> Job {
            let generation = self
                .attempts
                .iter()
                .filter(|a| a.webhook_id == webhook_id)
                .map(|a| a.generation)
                .max()
                .unwrap_or(0)
                + 1;
            self.next_seq += 1;

            let job = Job {
                id: JobId::for_webhook(webhook_id),
                webhook_id,
                generation,
                attempts_made: 0,
                max_attempts: profile.max_attempts,
                backoff_strategy: profile.backoff_strategy,
                base_delay_ms: profile.base_delay_ms,
                next_visible_at: now,
                lease_owner: None,
                lease_token: None,
                lease_expires_at: None,
                stalled_count: 0,
                enqueued_seq: self.next_seq,
                created_at: now,
            };
            self.jobs.insert(webhook_id, job.clone());
            job
        }
    }

    /// In-memory queue and storage sharing one lock.
    pub struct InMemoryStore {
        state: Mutex<State>,
        clock: Arc<dyn Clock>,
    }

    impl InMemoryStore {
        /// Creates an empty store reading time from `clock`.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self { state: Mutex::new(State::default()), clock }
        }

        /// Inserts a webhook row, as the ingestion layer would.
        pub async fn insert_webhook(&self, webhook: Webhook) -> WebhookId {
            let id = webhook.id;
            self.state.lock().await.webhooks.insert(id, webhook);
            id
        }

        /// Deletes a webhook row but keeps its job, as happens when the row
        /// is removed between lease and load.
        pub async fn remove_webhook(&self, id: WebhookId) {
            self.state.lock().await.webhooks.remove(&id);
        }

        /// Current webhook row.
        pub async fn webhook(&self, id: WebhookId) -> Option<Webhook> {
            self.state.lock().await.webhooks.get(&id).cloned()
        }

        /// Current job for a webhook.
        pub async fn job(&self, webhook_id: WebhookId) -> Option<Job> {
            self.state.lock().await.jobs.get(&webhook_id).cloned()
        }

        /// All dead-letter entries in insertion order.
        pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
            self.state.lock().await.dead_letters.clone()
        }

        /// Makes the next lease call fail with a database error.
        pub async fn fail_next_lease(&self, message: impl Into<String>) {
            self.state.lock().await.fail_next_lease = Some(message.into());
        }

        /// Makes the next write (attempt, ack, nack, delivered, dead letter)
        /// fail with a database error.
        pub async fn fail_next_write(&self, message: impl Into<String>) {
            self.state.lock().await.fail_next_write = Some(message.into());
        }
    }

    impl JobQueue for InMemoryStore {
        fn enqueue(&self, webhook_id: WebhookId, profile: RetryProfile) -> StorageFuture<'_, Job> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut state = self.state.lock().await;
                if let Some(existing) = state.jobs.get(&webhook_id) {
                    return Ok(existing.clone());
                }
                if !state.webhooks.contains_key(&webhook_id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "foreign key constraint violation: webhook {webhook_id} does not exist"
                    )));
                }
                Ok(state.insert_job(webhook_id, profile, now))
            })
        }

        fn lease(&self, owner: &str, lease_duration: Duration) -> StorageFuture<'_, Option<Lease>> {
            let owner = owner.to_string();
            Box::pin(async move {
                let lease_duration = chrono_duration(lease_duration)?;
                let now = self.clock.now_utc();
                let mut state = self.state.lock().await;
                if let Some(message) = state.fail_next_lease.take() {
                    return Err(CoreError::Database(message));
                }

                let candidate = state
                    .jobs
                    .values()
                    .filter(|job| !job.is_leased() && job.next_visible_at <= now)
                    .min_by_key(|job| (job.next_visible_at, job.enqueued_seq))
                    .map(|job| job.webhook_id);
                let Some(job) = candidate.and_then(|id| state.jobs.get_mut(&id)) else {
                    return Ok(None);
                };

                job.lease_owner = Some(owner);
                job.lease_token = Some(Uuid::new_v4());
                job.lease_expires_at = Some(now + lease_duration);
                Ok(job.lease())
            })
        }

        fn ack(&self, lease: &Lease) -> StorageFuture<'_, ()> {
            let lease = lease.clone();
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.injected_write_failure()?;
                state.check_lease(&lease)?;
                state.jobs.remove(&lease.webhook_id);
                Ok(())
            })
        }

        fn nack(&self, lease: &Lease, delay: Duration) -> StorageFuture<'_, ()> {
            let lease = lease.clone();
            Box::pin(async move {
                let visible_at = self.clock.now_utc() + chrono_duration(delay)?;
                let mut state = self.state.lock().await;
                state.injected_write_failure()?;
                state.check_lease(&lease)?;
                if let Some(job) = state.jobs.get_mut(&lease.webhook_id) {
                    job.attempts_made += 1;
                    job.next_visible_at = visible_at;
                    job.lease_owner = None;
                    job.lease_token = None;
                    job.lease_expires_at = None;
                }
                Ok(())
            })
        }

        fn release_stalled(&self, max_stalled_count: u32) -> StorageFuture<'_, StalledRelease> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let limit = i32::try_from(max_stalled_count).unwrap_or(i32::MAX);
                let mut state = self.state.lock().await;

                let mut stalled: Vec<(JobId, WebhookId, i32)> = Vec::new();
                for job in state.jobs.values_mut() {
                    if job.lease_expires_at.is_some_and(|expires_at| expires_at < now) {
                        job.lease_owner = None;
                        job.lease_token = None;
                        job.lease_expires_at = None;
                        job.stalled_count += 1;
                        stalled.push((job.id.clone(), job.webhook_id, job.stalled_count));
                    }
                }
                stalled.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

                let mut outcome = StalledRelease::default();
                for (job_id, webhook_id, stalled_count) in stalled {
                    if stalled_count <= limit {
                        outcome.released.push(job_id);
                        continue;
                    }

                    state.jobs.remove(&webhook_id);
                    if state
                        .transition(webhook_id, WebhookStatus::Pending, WebhookStatus::Failed, now)
                        .is_err()
                    {
                        continue;
                    }
                    let entry = DeadLetterEntry {
                        id: DeadLetterId::new(),
                        webhook_id,
                        reason: STALLED_REASON.to_string(),
                        final_error: Some(format!("lease expired {stalled_count} times")),
                        moved_at: now,
                    };
                    state.dead_letters.push(entry.clone());
                    outcome.dead_lettered.push(entry);
                }
                Ok(outcome)
            })
        }

        fn counts(&self) -> StorageFuture<'_, QueueCounts> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let state = self.state.lock().await;
                let mut counts = QueueCounts::default();
                for job in state.jobs.values() {
                    if job.is_leased() {
                        counts.active += 1;
                    } else if job.next_visible_at <= now {
                        counts.waiting += 1;
                    } else {
                        counts.delayed += 1;
                    }
                }
                Ok(counts)
            })
        }
    }

    impl DeliveryStorage for InMemoryStore {
        fn find_webhook(&self, id: WebhookId) -> StorageFuture<'_, Option<Webhook>> {
            Box::pin(async move { Ok(self.state.lock().await.webhooks.get(&id).cloned()) })
        }

        fn record_attempt(
            &self,
            lease: &Lease,
            attempt: DeliveryAttempt,
        ) -> StorageFuture<'_, bool> {
            let lease = lease.clone();
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.injected_write_failure()?;
                state.check_lease(&lease)?;

                let duplicate = state.attempts.iter().any(|a| {
                    a.webhook_id == attempt.webhook_id
                        && a.generation == attempt.generation
                        && a.attempt_number == attempt.attempt_number
                });
                if duplicate {
                    return Ok(false);
                }
                state.attempts.push(attempt);
                Ok(true)
            })
        }

        fn find_attempt(
            &self,
            webhook_id: WebhookId,
            generation: i32,
            attempt_number: i32,
        ) -> StorageFuture<'_, Option<DeliveryAttempt>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                Ok(state
                    .attempts
                    .iter()
                    .find(|a| {
                        a.webhook_id == webhook_id
                            && a.generation == generation
                            && a.attempt_number == attempt_number
                    })
                    .cloned())
            })
        }

        fn mark_delivered(&self, lease: &Lease) -> StorageFuture<'_, ()> {
            let lease = lease.clone();
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut state = self.state.lock().await;
                state.injected_write_failure()?;
                state.check_lease(&lease)?;
                state.transition(
                    lease.webhook_id,
                    WebhookStatus::Pending,
                    WebhookStatus::Delivered,
                    now,
                )?;
                state.jobs.remove(&lease.webhook_id);
                Ok(())
            })
        }

        fn move_to_dead_letter(
            &self,
            lease: &Lease,
            reason: String,
            final_error: Option<String>,
        ) -> StorageFuture<'_, DeadLetterEntry> {
            let lease = lease.clone();
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut state = self.state.lock().await;
                state.injected_write_failure()?;
                state.check_lease(&lease)?;
                state.transition(
                    lease.webhook_id,
                    WebhookStatus::Pending,
                    WebhookStatus::Failed,
                    now,
                )?;

                let entry = DeadLetterEntry {
                    id: DeadLetterId::new(),
                    webhook_id: lease.webhook_id,
                    reason,
                    final_error,
                    moved_at: now,
                };
                state.dead_letters.push(entry.clone());
                state.jobs.remove(&lease.webhook_id);
                Ok(entry)
            })
        }

        fn retry_from_dlq(&self, id: DeadLetterId, profile: RetryProfile) -> StorageFuture<'_, Job> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut state = self.state.lock().await;
                let position = state
                    .dead_letters
                    .iter()
                    .position(|entry| entry.id == id)
                    .ok_or_else(|| CoreError::NotFound(format!("dead letter entry {id}")))?;
                let webhook_id = state.dead_letters[position].webhook_id;

                state.transition(webhook_id, WebhookStatus::Failed, WebhookStatus::Pending, now)?;
                state.dead_letters.remove(position);
                state.jobs.remove(&webhook_id);
                Ok(state.insert_job(webhook_id, profile, now))
            })
        }

        fn find_attempts(&self, webhook_id: WebhookId) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                let mut attempts: Vec<DeliveryAttempt> =
                    state.attempts.iter().filter(|a| a.webhook_id == webhook_id).cloned().collect();
                attempts.sort_by_key(|a| (a.generation, a.attempt_number));
                Ok(attempts)
            })
        }

        fn find_dead_letter(
            &self,
            webhook_id: WebhookId,
        ) -> StorageFuture<'_, Option<DeadLetterEntry>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                Ok(state.dead_letters.iter().find(|e| e.webhook_id == webhook_id).cloned())
            })
        }

        fn list_dead_letters(&self, limit: i64, offset: i64) -> StorageFuture<'_, DeadLetterPage> {
            Box::pin(async move {
                let state = self.state.lock().await;
                let mut entries: Vec<DeadLetterEntry> =
                    state.dead_letters.iter().rev().cloned().collect();
                entries.sort_by(|a, b| b.moved_at.cmp(&a.moved_at));

                let total = i64::try_from(entries.len()).unwrap_or(i64::MAX);
                let entries = entries
                    .into_iter()
                    .skip(usize::try_from(offset).unwrap_or(0))
                    .take(usize::try_from(limit).unwrap_or(0))
                    .collect();
                Ok(DeadLetterPage { entries, total })
            })
        }

        fn stats_overview(&self) -> StorageFuture<'_, StatsOverview> {
            Box::pin(async move {
                let state = self.state.lock().await;
                let mut by_status: std::collections::BTreeMap<String, i64> =
                    WebhookStatus::ALL.iter().map(|s| (s.as_str().to_string(), 0)).collect();
                for webhook in state.webhooks.values() {
                    *by_status.entry(webhook.status.as_str().to_string()).or_default() += 1;
                }

                let total_attempts = i64::try_from(state.attempts.len()).unwrap_or(i64::MAX);
                #[allow(clippy::cast_precision_loss)]
                let avg_duration_ms = (total_attempts > 0).then(|| {
                    state.attempts.iter().map(|a| a.duration_ms as f64).sum::<f64>()
                        / total_attempts as f64
                });

                Ok(StatsOverview {
                    total_webhooks: by_status.values().sum(),
                    by_status,
                    dlq_count: i64::try_from(state.dead_letters.len()).unwrap_or(i64::MAX),
                    total_attempts,
                    avg_duration_ms,
                })
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(async move { Ok(()) })
        }
    }
}
