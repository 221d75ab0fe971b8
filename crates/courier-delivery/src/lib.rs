//! Durable webhook delivery: job queue, worker pool, retries and dead letters.
//!
//! Workers lease one job at a time from a [`queue::JobQueue`], load the
//! webhook, POST the signed payload and let the [`retry::RetryPolicy`]
//! decide what happens next:
//!
//! 1. **Deliver** - 2xx response; the webhook is marked delivered and the job
//!    acknowledged in one transaction.
//! 2. **Retry** - no response, 5xx or 429 with attempts left; the job is
//!    nacked and becomes visible again after the backoff delay.
//! 3. **Give up** - any other status, or attempts exhausted; the webhook
//!    moves to the dead-letter queue and the job is removed atomically.
//!
//! Every attempt is written to the attempt log before the decision is acted
//! on. A worker that dies mid-delivery leaves its lease to expire, and the
//! stalled sweeper makes the job visible again.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{RealClock, Signer};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), DeliveryError> {
//! let signer = Signer::new("server-secret")?;
//! let mut engine =
//!     DeliveryEngine::new(pool, DeliveryConfig::default(), signer, Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! // ...
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod queue;
pub mod retry;
pub mod storage;
mod sweeper;
pub mod worker;
pub mod worker_pool;

pub use engine::DeliveryEngine;
pub use error::{DeliveryError, Result};
pub use worker::{DeliveryConfig, EngineStats};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default lease duration in seconds. Must exceed the request timeout.
pub const DEFAULT_LEASE_SECONDS: u64 = 60;

/// Default interval between stalled-lease sweeps in seconds.
pub const DEFAULT_STALLED_INTERVAL_SECONDS: u64 = 30;

/// Default number of lease expiries a job survives before it is
/// dead-lettered.
pub const DEFAULT_MAX_STALLED_COUNT: u32 = 2;
