//! Domain models and strongly-typed identifiers.
//!
//! Covers the four persisted entities of the delivery core (webhooks, queue
//! jobs, delivery attempts and dead-letter entries), the lease handle a
//! worker holds while delivering, and the aggregate views used for
//! observability. Identifier newtypes carry their own sqlx encoding so they
//! bind directly into queries.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed webhook identifier.
///
/// Assigned by the ingestion layer when the webhook row is created and used
/// to derive the queue job id.
///
/// # Example
///
/// ```
/// use courier_core::models::{JobId, WebhookId};
/// let id = WebhookId::new();
/// assert_eq!(JobId::for_webhook(id).as_str(), format!("webhook-{id}"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookId(pub Uuid);

impl WebhookId {
    /// Creates a new random webhook ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WebhookId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for WebhookId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for WebhookId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for WebhookId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed dead-letter entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadLetterId(pub Uuid);

impl DeadLetterId {
    /// Creates a new random dead-letter ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeadLetterId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeadLetterId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeadLetterId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for DeadLetterId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Queue job identifier, derived deterministically from the webhook id.
///
/// Because the id is a pure function of the webhook, a second enqueue for
/// the same webhook collides with the existing row instead of creating a
/// duplicate job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Derives the job id for a webhook.
    pub fn for_webhook(webhook_id: WebhookId) -> Self {
        Self(format!("webhook-{webhook_id}"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        Ok(Self(<String as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Delivery status of a webhook.
///
/// Legal transitions:
///
/// ```text
/// Pending --> Delivered
/// Pending --> Failed --> Pending   (dead-letter retry)
/// ```
///
/// `Delivered` is final. Use [`WebhookStatus::transition_to`] rather than
/// assigning statuses directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    /// Waiting for a successful delivery.
    Pending,
    /// Delivered with a 2xx response.
    Delivered,
    /// Quarantined in the dead-letter queue.
    Failed,
}

impl WebhookStatus {
    /// All statuses, in display order.
    pub const ALL: [Self; 3] = [Self::Pending, Self::Delivered, Self::Failed];

    /// Returns whether moving from `self` to `next` is allowed.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Delivered) | (Self::Pending, Self::Failed) | (Self::Failed, Self::Pending)
        )
    }

    /// Validates a transition and returns the new status.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` for transitions outside the
    /// state machine.
    pub fn transition_to(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition { from: self, to: next })
        }
    }

    /// Lowercase name as stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("invalid webhook status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for WebhookStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|e: CoreError| e.to_string().into())
    }
}

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * 2^attempts_made`.
    Exponential,
    /// Always `base`.
    Fixed,
}

impl BackoffStrategy {
    /// Lowercase name as stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Fixed => "fixed",
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exponential" => Ok(Self::Exponential),
            "fixed" => Ok(Self::Fixed),
            other => Err(CoreError::InvalidInput(format!("invalid backoff strategy: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for BackoffStrategy {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for BackoffStrategy {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|e: CoreError| e.to_string().into())
    }
}

/// Retry schedule stored on a job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryProfile {
    /// Total attempts allowed, including the first.
    pub max_attempts: i32,
    /// Growth of the delay between attempts.
    pub backoff_strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    pub base_delay_ms: i64,
}

/// A webhook to be delivered.
///
/// Owned by the ingestion layer. The delivery core only reads it and writes
/// `status` and `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    /// Unique identifier.
    pub id: WebhookId,

    /// Endpoint the payload is POSTed to.
    pub target_url: String,

    /// JSON payload.
    pub payload: Json<serde_json::Value>,

    /// Optional header overrides applied after the default headers.
    pub headers: Option<Json<BTreeMap<String, String>>>,

    /// Signature computed at creation (`sha256=<hex>`).
    pub signature: Option<String>,

    /// Current delivery status.
    pub status: WebhookStatus,

    /// When the webhook was created.
    pub created_at: DateTime<Utc>,

    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Builds a pending webhook with no header overrides or signature.
    pub fn new(target_url: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: WebhookId::new(),
            target_url: target_url.into(),
            payload: Json(payload),
            headers: None,
            signature: None,
            status: WebhookStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets header overrides.
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = Some(Json(headers));
        self
    }

    /// Sets the stored signature.
    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Header overrides, empty when none were supplied.
    pub fn header_overrides(&self) -> BTreeMap<String, String> {
        self.headers.as_ref().map(|h| h.0.clone()).unwrap_or_default()
    }
}

/// A queue job: one pending delivery cycle for a webhook.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Deterministic id, see [`JobId::for_webhook`].
    pub id: JobId,

    /// Webhook this job delivers.
    pub webhook_id: WebhookId,

    /// Delivery cycle number. Incremented on every fresh enqueue and every
    /// dead-letter resurrection.
    pub generation: i32,

    /// Attempts already made in this generation.
    pub attempts_made: i32,

    /// Attempt ceiling for this generation.
    pub max_attempts: i32,

    /// Backoff growth.
    pub backoff_strategy: BackoffStrategy,

    /// Backoff base in milliseconds.
    pub base_delay_ms: i64,

    /// Earliest time the job may be leased.
    pub next_visible_at: DateTime<Utc>,

    /// Worker currently holding the lease.
    pub lease_owner: Option<String>,

    /// Token identifying the current lease.
    pub lease_token: Option<Uuid>,

    /// When the current lease expires.
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Times a lease on this job expired without being settled.
    pub stalled_count: i32,

    /// Insertion order, used to break ties on `next_visible_at`.
    pub enqueued_seq: i64,

    /// When the job row was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Returns whether a worker currently holds this job.
    pub fn is_leased(&self) -> bool {
        self.lease_token.is_some()
    }

    /// Retry schedule stored on the job.
    pub fn profile(&self) -> RetryProfile {
        RetryProfile {
            max_attempts: self.max_attempts,
            backoff_strategy: self.backoff_strategy,
            base_delay_ms: self.base_delay_ms,
        }
    }

    /// Lease handle for the current holder, if any.
    pub fn lease(&self) -> Option<Lease> {
        let (Some(owner), Some(token), Some(expires_at)) =
            (self.lease_owner.clone(), self.lease_token, self.lease_expires_at)
        else {
            return None;
        };

        Some(Lease {
            job_id: self.id.clone(),
            webhook_id: self.webhook_id,
            generation: self.generation,
            token,
            owner,
            attempts_made: self.attempts_made,
            profile: self.profile(),
            expires_at,
        })
    }
}

/// Exclusive, time-bounded claim on a job.
///
/// Every write a worker performs on behalf of a job (attempt recording,
/// ack, nack, delivery, dead-lettering) is conditional on the job row still
/// carrying this lease's `token` and `generation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Leased job.
    pub job_id: JobId,
    /// Webhook being delivered.
    pub webhook_id: WebhookId,
    /// Generation the lease was taken on.
    pub generation: i32,
    /// Unique token for this lease acquisition.
    pub token: Uuid,
    /// Worker holding the lease.
    pub owner: String,
    /// Attempts made before this lease.
    pub attempts_made: i32,
    /// Retry schedule of the job.
    pub profile: RetryProfile,
    /// When the lease lapses unless acked or nacked.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// 1-based number of the attempt this lease will make.
    pub fn attempt_number(&self) -> i32 {
        self.attempts_made.saturating_add(1)
    }
}

/// One recorded delivery attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Unique identifier.
    pub id: Uuid,

    /// Webhook the attempt was for.
    pub webhook_id: WebhookId,

    /// Job generation the attempt belongs to.
    pub generation: i32,

    /// 1-based, gapless within a generation.
    pub attempt_number: i32,

    /// HTTP status, absent when no response was received.
    pub response_status: Option<i32>,

    /// Response body excerpt.
    pub response_body: Option<String>,

    /// Transport or HTTP error description.
    pub error_message: Option<String>,

    /// Wall time of the HTTP call.
    pub duration_ms: i64,

    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Returns whether the attempt received a 2xx response.
    pub fn succeeded(&self) -> bool {
        matches!(self.response_status, Some(200..=299))
    }
}

/// A webhook quarantined after a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetterEntry {
    /// Unique identifier.
    pub id: DeadLetterId,
    /// Failed webhook.
    pub webhook_id: WebhookId,
    /// Why delivery was abandoned.
    pub reason: String,
    /// Error of the final attempt.
    pub final_error: Option<String>,
    /// When the webhook was dead-lettered.
    pub moved_at: DateTime<Utc>,
}

/// One page of dead-letter entries, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterPage {
    /// Entries on this page.
    pub entries: Vec<DeadLetterEntry>,
    /// Total number of entries.
    pub total: i64,
}

/// Outcome of one stalled-lease sweep.
#[derive(Debug, Clone, Default)]
pub struct StalledRelease {
    /// Jobs returned to the queue, visible immediately.
    pub released: Vec<JobId>,
    /// Jobs that exceeded the stall limit and were dead-lettered instead.
    pub dead_lettered: Vec<DeadLetterEntry>,
}

/// Job counts by queue state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Visible and unleased.
    pub waiting: i64,
    /// Currently leased.
    pub active: i64,
    /// Unleased but not yet visible (backing off).
    pub delayed: i64,
}

/// Aggregate delivery statistics computed from persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsOverview {
    /// Webhook counts keyed by status name.
    pub by_status: BTreeMap<String, i64>,
    /// Total webhooks.
    pub total_webhooks: i64,
    /// Dead-letter entries.
    pub dlq_count: i64,
    /// Delivery attempts recorded.
    pub total_attempts: i64,
    /// Mean attempt duration in milliseconds, absent when there are none.
    pub avg_duration_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_deterministic() {
        let id = WebhookId(Uuid::nil());
        assert_eq!(JobId::for_webhook(id), JobId::for_webhook(id));
        assert_eq!(JobId::for_webhook(id).as_str(), "webhook-00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in WebhookStatus::ALL {
            assert_eq!(status.as_str().parse::<WebhookStatus>().unwrap(), status);
        }
        assert!("delivering".parse::<WebhookStatus>().is_err());
    }

    #[test]
    fn lease_only_exists_when_fully_populated() {
        let now = Utc::now();
        let mut job = Job {
            id: JobId::for_webhook(WebhookId::new()),
            webhook_id: WebhookId::new(),
            generation: 1,
            attempts_made: 2,
            max_attempts: 5,
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            next_visible_at: now,
            lease_owner: Some("worker-0".into()),
            lease_token: None,
            lease_expires_at: Some(now),
            stalled_count: 0,
            enqueued_seq: 1,
            created_at: now,
        };
        assert!(job.lease().is_none());

        job.lease_token = Some(Uuid::new_v4());
        let lease = job.lease().unwrap();
        assert_eq!(lease.attempt_number(), 3);
        assert_eq!(lease.profile.max_attempts, 5);
    }
}
