//! Courier webhook delivery service.
//!
//! Main entry point. Loads configuration, prepares the database, runs the
//! delivery engine and coordinates a bounded graceful shutdown.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::schema, RealClock, Signer};
use courier_delivery::{DeliveryEngine, DeliveryError};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!("starting courier webhook delivery service");
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        workers = config.worker_pool_size,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database schema ready");

    let signer = Signer::new(&config.webhook_secret).context("invalid WEBHOOK_SECRET")?;
    let mut engine = DeliveryEngine::new(
        db_pool.clone(),
        config.to_delivery_config(),
        signer,
        Arc::new(RealClock::new()),
    )
    .context("failed to create delivery engine")?;

    engine.health_check().await.context("database health check failed")?;
    let counts = engine.queue_counts().await.context("failed to read queue counts")?;
    info!(
        waiting = counts.waiting,
        active = counts.active,
        delayed = counts.delayed,
        "delivery queue ready"
    );

    engine.start().await.context("failed to start delivery engine")?;
    info!("courier is delivering webhooks");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    let stats = engine.stats().await;
    info!(
        in_flight = stats.in_flight_deliveries,
        delivered = stats.successful_deliveries,
        dead_lettered = stats.dead_lettered,
        "stopping delivery workers"
    );

    match engine.shutdown().await {
        Ok(()) => info!("delivery engine stopped"),
        Err(DeliveryError::ShutdownTimeout { timeout }) => {
            error!(
                timeout_seconds = timeout.as_secs(),
                "grace period exceeded, forcing exit; unfinished leases will be swept"
            );
            db_pool.close().await;
            std::process::exit(1);
        },
        Err(e) => warn!(error = %e, "delivery engine stopped with error"),
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing with the configured log filter.
fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives).context("invalid RUST_LOG filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates the delivery tables and indexes if missing.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    schema::apply(pool).await.context("failed to apply database schema")
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C signal");
        },
        () = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
