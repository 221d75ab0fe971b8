//! Configuration for the courier delivery service.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_delivery::{
    client::ClientConfig,
    retry::{BackoffStrategy, RetryPolicy},
    DeliveryConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Everything has a default except `WEBHOOK_SECRET`, which must be set.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Signing
    /// Server secret used to sign payloads that have no stored signature.
    ///
    /// Environment variable: `WEBHOOK_SECRET`
    #[serde(default, alias = "WEBHOOK_SECRET")]
    pub webhook_secret: String,

    // Workers
    /// Number of concurrent delivery workers.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,
    /// Idle poll interval in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,
    /// Lease duration in seconds. Must exceed the delivery timeout.
    ///
    /// Environment variable: `LEASE_DURATION_SECONDS`
    #[serde(default = "default_lease_seconds", alias = "LEASE_DURATION_SECONDS")]
    pub lease_duration_seconds: u64,
    /// Stalled sweep interval in seconds.
    ///
    /// Environment variable: `STALLED_INTERVAL_SECONDS`
    #[serde(default = "default_stalled_interval", alias = "STALLED_INTERVAL_SECONDS")]
    pub stalled_interval_seconds: u64,
    /// Lease expiries a job survives before it is dead-lettered.
    ///
    /// Environment variable: `MAX_STALLED_COUNT`
    #[serde(default = "default_max_stalled_count", alias = "MAX_STALLED_COUNT")]
    pub max_stalled_count: u32,

    // Retry
    /// Maximum delivery attempts per webhook, including the first.
    ///
    /// Environment variable: `MAX_RETRY_ATTEMPTS`
    #[serde(default = "default_retry_attempts", alias = "MAX_RETRY_ATTEMPTS")]
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,

    // Client
    /// HTTP request timeout for webhook delivery in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,

    // Shutdown
    /// Grace period for in-flight deliveries on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_GRACE_SECONDS`
    #[serde(default = "default_shutdown_grace", alias = "SHUTDOWN_GRACE_SECONDS")]
    pub shutdown_grace_seconds: u64,

    // Logging
    /// Log filter, used when `RUST_LOG` is not read directly by the
    /// subscriber.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, config file, and environment.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to the delivery engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_pool_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_duration: Duration::from_secs(self.lease_duration_seconds),
            stalled_interval: Duration::from_secs(self.stalled_interval_seconds),
            max_stalled_count: self.max_stalled_count,
            client_config: self.to_client_config(),
            default_retry_policy: self.to_retry_policy(),
            shutdown_timeout: Duration::from_secs(self.shutdown_grace_seconds),
        }
    }

    /// Converts to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Converts to the default retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        let url = &self.database_url;
        let userinfo_start = url.find("://").map_or(0, |i| i + 3);

        if let Some(at_pos) = url[userinfo_start..].find('@').map(|i| i + userinfo_start) {
            if let Some(colon_pos) = url[userinfo_start..at_pos].find(':').map(|i| i + userinfo_start)
            {
                let mut masked = url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.webhook_secret.is_empty() {
            anyhow::bail!("WEBHOOK_SECRET must be set");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be greater than 0");
        }

        if self.lease_duration_seconds <= self.delivery_timeout_seconds {
            anyhow::bail!(
                "lease_duration_seconds ({}) must exceed delivery_timeout_seconds ({})",
                self.lease_duration_seconds,
                self.delivery_timeout_seconds
            );
        }

        self.to_delivery_config().validate().context("invalid delivery configuration")?;

        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url_masked())
            .field("database_max_connections", &self.database_max_connections)
            .field("database_min_connections", &self.database_min_connections)
            .field("database_connection_timeout", &self.database_connection_timeout)
            .field("webhook_secret", &"***")
            .field("worker_pool_size", &self.worker_pool_size)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("lease_duration_seconds", &self.lease_duration_seconds)
            .field("stalled_interval_seconds", &self.stalled_interval_seconds)
            .field("max_stalled_count", &self.max_stalled_count)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("retry_max_delay_ms", &self.retry_max_delay_ms)
            .field("delivery_timeout_seconds", &self.delivery_timeout_seconds)
            .field("shutdown_grace_seconds", &self.shutdown_grace_seconds)
            .field("rust_log", &self.rust_log)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            webhook_secret: String::new(),
            worker_pool_size: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_duration_seconds: default_lease_seconds(),
            stalled_interval_seconds: default_stalled_interval(),
            max_stalled_count: default_max_stalled_count(),
            max_retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            delivery_timeout_seconds: default_delivery_timeout(),
            shutdown_grace_seconds: default_shutdown_grace(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_worker_count() -> usize {
    courier_delivery::DEFAULT_WORKER_COUNT
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_seconds() -> u64 {
    courier_delivery::DEFAULT_LEASE_SECONDS
}

fn default_stalled_interval() -> u64 {
    courier_delivery::DEFAULT_STALLED_INTERVAL_SECONDS
}

fn default_max_stalled_count() -> u32 {
    courier_delivery::DEFAULT_MAX_STALLED_COUNT
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

fn default_delivery_timeout() -> u64 {
    courier_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,courier=debug".to_string()
}
