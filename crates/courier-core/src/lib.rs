//! Core domain types for webhook delivery.
//!
//! Provides strongly-typed identifiers, the webhook status state machine,
//! payload signing, the clock abstraction and the PostgreSQL repositories
//! shared by the delivery engine and the service binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod signing;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    BackoffStrategy, DeadLetterEntry, DeadLetterId, DeadLetterPage, DeliveryAttempt, Job, JobId,
    Lease, QueueCounts, RetryProfile, StalledRelease, StatsOverview, Webhook, WebhookId, WebhookStatus,
};
pub use signing::Signer;
pub use time::{Clock, RealClock, TestClock};
