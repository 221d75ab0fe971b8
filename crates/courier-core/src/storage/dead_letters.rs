//! Repository for the dead-letter queue.
//!
//! Entries are only written and removed inside the transactions in
//! [`crate::storage::Storage`] that also move the webhook status and the
//! job row, so an entry exists exactly while its webhook is `failed`.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DeadLetterEntry, DeadLetterId, DeadLetterPage, WebhookId},
};

/// Repository for `dead_letter_queue`.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts an entry within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails, including when the webhook already
    /// has an entry.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &DeadLetterEntry,
    ) -> Result<DeadLetterId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO dead_letter_queue (id, webhook_id, reason, final_error, moved_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(entry.id)
        .bind(entry.webhook_id)
        .bind(&entry.reason)
        .bind(&entry.final_error)
        .bind(entry.moved_at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Deletes an entry within a transaction and returns it.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn take_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            DELETE FROM dead_letter_queue
            WHERE id = $1
            RETURNING id, webhook_id, reason, final_error, moved_at
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(entry)
    }

    /// Finds the entry for a webhook.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_webhook(&self, webhook_id: WebhookId) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT id, webhook_id, reason, final_error, moved_at
            FROM dead_letter_queue
            WHERE webhook_id = $1
            "#,
        )
        .bind(webhook_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Lists entries newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<DeadLetterPage> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT id, webhook_id, reason, final_error, moved_at
            FROM dead_letter_queue
            ORDER BY moved_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&*self.pool)
        .await?;

        let total = self.count().await?;

        Ok(DeadLetterPage { entries, total })
    }

    /// Counts entries.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(&*self.pool)
            .await?;

        Ok(count.0)
    }
}
