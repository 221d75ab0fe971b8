//! Repository for the append-only delivery attempt log.
//!
//! Rows are never updated or deleted. The `(webhook_id, generation,
//! attempt_number)` key is unique and inserts skip conflicts, so replaying
//! an attempt after a crash cannot create a duplicate entry; the worker
//! looks the key up first and settles from the recorded outcome instead.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DeliveryAttempt, WebhookId},
};

/// Repository for `delivery_attempts`.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Records an attempt within a transaction.
    ///
    /// Returns `false` when an attempt with the same number already exists
    /// for this webhook and generation.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn record_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt: &DeliveryAttempt,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO delivery_attempts (
                id, webhook_id, generation, attempt_number,
                response_status, response_body, error_message,
                duration_ms, attempted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (webhook_id, generation, attempt_number) DO NOTHING
            ",
        )
        .bind(attempt.id)
        .bind(attempt.webhook_id)
        .bind(attempt.generation)
        .bind(attempt.attempt_number)
        .bind(attempt.response_status)
        .bind(&attempt.response_body)
        .bind(&attempt.error_message)
        .bind(attempt.duration_ms)
        .bind(attempt.attempted_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds all attempts for a webhook, oldest cycle first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_webhook(&self, webhook_id: WebhookId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT id, webhook_id, generation, attempt_number,
                   response_status, response_body, error_message,
                   duration_ms, attempted_at
            FROM delivery_attempts
            WHERE webhook_id = $1
            ORDER BY generation ASC, attempt_number ASC
            ",
        )
        .bind(webhook_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Finds the attempt recorded under one ledger key, if any.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_one(
        &self,
        webhook_id: WebhookId,
        generation: i32,
        attempt_number: i32,
    ) -> Result<Option<DeliveryAttempt>> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT id, webhook_id, generation, attempt_number,
                   response_status, response_body, error_message,
                   duration_ms, attempted_at
            FROM delivery_attempts
            WHERE webhook_id = $1 AND generation = $2 AND attempt_number = $3
            ",
        )
        .bind(webhook_id)
        .bind(generation)
        .bind(attempt_number)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(attempt)
    }

    /// Returns the total attempt count and the mean duration in ms.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn summary(&self) -> Result<(i64, Option<f64>)> {
        let summary: (i64, Option<f64>) = sqlx::query_as(
            r"
            SELECT COUNT(*), AVG(duration_ms)::FLOAT8
            FROM delivery_attempts
            ",
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(summary)
    }
}
