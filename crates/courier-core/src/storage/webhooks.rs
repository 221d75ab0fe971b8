//! Repository for webhook rows.
//!
//! The ingestion layer owns webhook creation. The delivery core reads rows
//! by id and moves them through the status state machine; every status
//! write is a compare-and-set on the expected current status.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{Webhook, WebhookId, WebhookStatus},
};

/// Repository for `webhooks`.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a webhook row.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, webhook: &Webhook) -> Result<WebhookId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO webhooks (
                id, target_url, payload, headers, signature, status, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(webhook.id)
        .bind(&webhook.target_url)
        .bind(&webhook.payload)
        .bind(&webhook.headers)
        .bind(&webhook.signature)
        .bind(webhook.status.as_str())
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds a webhook by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: WebhookId) -> Result<Option<Webhook>> {
        self.find_by_id_impl(&*self.pool, id).await
    }

    /// Finds a webhook by id within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: WebhookId,
    ) -> Result<Option<Webhook>> {
        self.find_by_id_impl(&mut **tx, id).await
    }

    /// Private helper for finding webhooks with generic executor.
    async fn find_by_id_impl<'e, E>(&self, executor: E, id: WebhookId) -> Result<Option<Webhook>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT id, target_url, payload, headers, signature, status, created_at, updated_at
            FROM webhooks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await?;

        Ok(webhook)
    }

    /// Moves a webhook from `from` to `to` within a transaction.
    ///
    /// The update only applies if the row is still in `from`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if the state machine forbids
    /// the change or the row is in a different status, and
    /// `CoreError::NotFound` if the row does not exist.
    pub async fn transition_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: WebhookId,
        from: WebhookStatus,
        to: WebhookStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        from.transition_to(to)?;

        let result = sqlx::query(
            r#"
            UPDATE webhooks
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.find_by_id_in_tx(tx, id).await? {
            Some(current) => Err(CoreError::InvalidTransition { from: current.status, to }),
            None => Err(CoreError::NotFound(format!("webhook {id}"))),
        }
    }

    /// Counts webhooks per status. Statuses with no rows report zero.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM webhooks GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;

        let mut counts: BTreeMap<String, i64> =
            WebhookStatus::ALL.iter().map(|s| (s.as_str().to_string(), 0)).collect();
        counts.extend(rows);

        Ok(counts)
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
