//! Database schema for the delivery tables.
//!
//! Every statement is idempotent, so [`apply`] runs on each start.

use sqlx::PgPool;

use crate::error::{CoreError, Result};

/// Schema statements, applied in order. Each is idempotent.
pub const STATEMENTS: &[(&str, &str)] = &[
    (
        "webhooks table",
        r#"
        CREATE TABLE IF NOT EXISTS webhooks (
            id UUID PRIMARY KEY,
            target_url TEXT NOT NULL,
            payload JSONB NOT NULL,
            headers JSONB,
            signature TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'delivered', 'failed')),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "delivery_jobs table",
        r#"
        CREATE TABLE IF NOT EXISTS delivery_jobs (
            id TEXT PRIMARY KEY,
            webhook_id UUID NOT NULL UNIQUE REFERENCES webhooks(id) ON DELETE CASCADE,
            generation INTEGER NOT NULL CHECK (generation > 0),
            attempts_made INTEGER NOT NULL DEFAULT 0 CHECK (attempts_made >= 0),
            max_attempts INTEGER NOT NULL CHECK (max_attempts > 0),
            backoff_strategy TEXT NOT NULL CHECK (backoff_strategy IN ('exponential', 'fixed')),
            base_delay_ms BIGINT NOT NULL CHECK (base_delay_ms >= 0),
            next_visible_at TIMESTAMPTZ NOT NULL,
            lease_owner TEXT,
            lease_token UUID,
            lease_expires_at TIMESTAMPTZ,
            stalled_count INTEGER NOT NULL DEFAULT 0 CHECK (stalled_count >= 0),
            enqueued_seq BIGSERIAL NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "delivery_jobs stalled_count column",
        r#"
        ALTER TABLE delivery_jobs
        ADD COLUMN IF NOT EXISTS stalled_count INTEGER NOT NULL DEFAULT 0
        "#,
    ),
    (
        "delivery_attempts table",
        r#"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            webhook_id UUID NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
            generation INTEGER NOT NULL,
            attempt_number INTEGER NOT NULL CHECK (attempt_number > 0),
            response_status INTEGER,
            response_body TEXT,
            error_message TEXT,
            duration_ms BIGINT NOT NULL,
            attempted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (webhook_id, generation, attempt_number)
        )
        "#,
    ),
    (
        "dead_letter_queue table",
        r#"
        CREATE TABLE IF NOT EXISTS dead_letter_queue (
            id UUID PRIMARY KEY,
            webhook_id UUID NOT NULL UNIQUE REFERENCES webhooks(id) ON DELETE CASCADE,
            reason TEXT NOT NULL,
            final_error TEXT,
            moved_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "delivery_jobs visibility index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_jobs_visible
        ON delivery_jobs (next_visible_at, enqueued_seq)
        WHERE lease_token IS NULL
        "#,
    ),
    (
        "delivery_jobs lease expiry index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_jobs_lease_expiry
        ON delivery_jobs (lease_expires_at)
        WHERE lease_token IS NOT NULL
        "#,
    ),
    (
        "dead_letter_queue moved_at index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_dead_letter_queue_moved_at
        ON dead_letter_queue (moved_at DESC)
        "#,
    ),
    (
        "webhooks status index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_webhooks_status ON webhooks (status)
        "#,
    ),
];

/// Creates the four delivery tables and their indexes if missing.
///
/// # Errors
///
/// Returns `CoreError::Database` naming the object that failed.
pub async fn apply(pool: &PgPool) -> Result<()> {
    for (what, statement) in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| CoreError::Database(format!("failed to create {what}: {e}")))?;
    }
    Ok(())
}
