//! Outcome classification and backoff scheduling.
//!
//! Pure functions only: no clock, no I/O. The worker feeds in the attempt
//! count and the classified HTTP outcome and acts on the returned
//! [`RetryDecision`].

use std::time::Duration;

pub use courier_core::BackoffStrategy;
use courier_core::{DeliveryAttempt, RetryProfile};
use serde::{Deserialize, Serialize};

use crate::{
    client::DeliveryResponse,
    error::{DeliveryError, Result},
};

/// Reason recorded when a retryable failure uses up the last attempt.
pub const EXHAUSTED_REASON: &str = "Exhausted all retry attempts";

/// Three-way verdict on a delivery outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 2xx response.
    Success,
    /// No response, 5xx or 429.
    Retryable,
    /// Any other status. Ends retries immediately.
    Terminal,
}

/// Classifies the result of one HTTP call.
pub fn classify(outcome: &Result<DeliveryResponse>) -> Classification {
    classify_failure(failure(outcome).as_ref())
}

/// Classifies an outcome already reduced to its failure, if any.
pub fn classify_failure(failure: Option<&DeliveryError>) -> Classification {
    match failure {
        None => Classification::Success,
        Some(error) if error.is_retryable() => Classification::Retryable,
        Some(_) => Classification::Terminal,
    }
}

/// Rebuilds the failure of an attempt read back from the ledger.
///
/// A recorded status is judged exactly as a live response with that status.
/// An attempt without a status never got a response and is a network
/// failure carrying the recorded message.
pub fn recorded_failure(attempt: &DeliveryAttempt) -> Option<DeliveryError> {
    match attempt.response_status {
        Some(status) if (200..300).contains(&status) => None,
        Some(status) => Some(DeliveryError::from_status(
            u16::try_from(status).unwrap_or(0),
            attempt.response_body.clone().unwrap_or_default(),
        )),
        None => Some(DeliveryError::NetworkError {
            message: attempt.error_message.clone().unwrap_or_default(),
        }),
    }
}

/// The error describing a failed outcome, or `None` for a 2xx response.
pub fn failure(outcome: &Result<DeliveryResponse>) -> Option<DeliveryError> {
    match outcome {
        Ok(response) if response.is_success => None,
        Ok(response) => Some(DeliveryError::from_status(response.status_code, response.body.clone())),
        Err(error) => Some(error.clone()),
    }
}

/// What the worker should do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Mark delivered and acknowledge the job.
    Deliver,
    /// Nack the job so it becomes visible again after `delay`.
    Retry {
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// Move the webhook to the dead-letter queue.
    GiveUp {
        /// Reason stored on the dead-letter entry
        reason: String,
    },
}

/// Retry schedule and ceiling for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// How delays grow between attempts.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// Cap applied when none is configured.
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);

    /// Five attempts, exponential from one second: 1s, 2s, 4s, 8s, 16s.
    pub fn standard() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Self::DEFAULT_MAX_DELAY,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Two attempts, 1.5s apart. Same classification rules as
    /// [`RetryPolicy::standard`], shorter schedule.
    pub fn accelerated() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(1500),
            max_delay: Self::DEFAULT_MAX_DELAY,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }

    /// Rebuilds a policy from the profile stored on a job.
    ///
    /// Out-of-range values stored in the database are clamped to zero.
    pub fn from_profile(profile: RetryProfile, max_delay: Duration) -> Self {
        Self {
            max_attempts: u32::try_from(profile.max_attempts).unwrap_or(0),
            base_delay: Duration::from_millis(u64::try_from(profile.base_delay_ms).unwrap_or(0)),
            max_delay,
            backoff_strategy: profile.backoff_strategy,
        }
    }

    /// Profile to store on a job enqueued under this policy.
    pub fn profile(&self) -> RetryProfile {
        RetryProfile {
            max_attempts: i32::try_from(self.max_attempts).unwrap_or(i32::MAX),
            backoff_strategy: self.backoff_strategy,
            base_delay_ms: i64::try_from(self.base_delay.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Delay before the next attempt, given the attempts already made.
    ///
    /// Exponential: `base * 2^attempts_made`. Fixed: `base`. Both capped at
    /// `max_delay`.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => 2_u32
                .checked_pow(attempts_made)
                .and_then(|multiplier| self.base_delay.checked_mul(multiplier))
                .unwrap_or(self.max_delay),
        };

        delay.min(self.max_delay)
    }

    /// Decides what to do after an attempt.
    ///
    /// `attempts_made` counts attempts before the one just made. Terminal
    /// failures give up before the attempt ceiling is considered, so a 404
    /// never consumes the remaining attempts.
    pub fn decide(
        &self,
        attempts_made: u32,
        classification: Classification,
        error: Option<&DeliveryError>,
    ) -> RetryDecision {
        match classification {
            Classification::Success => RetryDecision::Deliver,
            Classification::Terminal => RetryDecision::GiveUp { reason: terminal_reason(error) },
            Classification::Retryable => {
                if attempts_made.saturating_add(1) >= self.max_attempts {
                    RetryDecision::GiveUp { reason: EXHAUSTED_REASON.to_string() }
                } else {
                    RetryDecision::Retry { delay: self.delay_for(attempts_made) }
                }
            },
        }
    }
}

fn terminal_reason(error: Option<&DeliveryError>) -> String {
    match error {
        Some(error) => match error.status_code() {
            Some(status) => format!("Non-retryable HTTP {status} error"),
            None => format!("Non-retryable error: {error}"),
        },
        None => "Non-retryable error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status_code: u16) -> Result<DeliveryResponse> {
        Ok(DeliveryResponse {
            status_code,
            body: String::new(),
            duration: Duration::from_millis(5),
            is_success: (200..300).contains(&status_code),
        })
    }

    #[test]
    fn standard_exponential_schedule() {
        let policy = RetryPolicy::standard();
        let delays: Vec<u128> = (0..5).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn fixed_schedule_never_grows() {
        let policy = RetryPolicy::accelerated();
        for attempts_made in 0..10 {
            assert_eq!(policy.delay_for(attempts_made), Duration::from_millis(1500));
        }
    }

    #[test]
    fn huge_exponents_saturate_at_cap() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(60), ..RetryPolicy::standard() };
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn classification_follows_status() {
        assert_eq!(classify(&response(200)), Classification::Success);
        assert_eq!(classify(&response(204)), Classification::Success);
        assert_eq!(classify(&response(500)), Classification::Retryable);
        assert_eq!(classify(&response(503)), Classification::Retryable);
        assert_eq!(classify(&response(429)), Classification::Retryable);
        assert_eq!(classify(&response(404)), Classification::Terminal);
        assert_eq!(classify(&response(400)), Classification::Terminal);
        assert_eq!(classify(&response(301)), Classification::Terminal);
        assert_eq!(classify(&Err(DeliveryError::network("refused"))), Classification::Retryable);
        assert_eq!(classify(&Err(DeliveryError::timeout(30))), Classification::Retryable);
    }

    #[test]
    fn retries_until_last_attempt() {
        let policy = RetryPolicy::standard();
        assert_eq!(
            policy.decide(0, Classification::Retryable, None),
            RetryDecision::Retry { delay: Duration::from_secs(1) }
        );
        assert_eq!(
            policy.decide(3, Classification::Retryable, None),
            RetryDecision::Retry { delay: Duration::from_secs(8) }
        );
        assert_eq!(
            policy.decide(4, Classification::Retryable, None),
            RetryDecision::GiveUp { reason: EXHAUSTED_REASON.to_string() }
        );
    }

    #[test]
    fn terminal_gives_up_on_first_attempt() {
        let policy = RetryPolicy::standard();
        let error = DeliveryError::from_status(404, "missing");
        assert_eq!(
            policy.decide(0, Classification::Terminal, Some(&error)),
            RetryDecision::GiveUp { reason: "Non-retryable HTTP 404 error".to_string() }
        );
    }

    #[test]
    fn terminal_without_status_names_the_error() {
        let policy = RetryPolicy::standard();
        let error = DeliveryError::configuration("relative URL without a base");
        let RetryDecision::GiveUp { reason } =
            policy.decide(0, Classification::Terminal, Some(&error))
        else {
            unreachable!("terminal outcomes always give up");
        };
        assert!(reason.starts_with("Non-retryable error: invalid configuration"));
    }

    #[test]
    fn recorded_outcomes_classify_like_live_ones() {
        let recorded = |status: Option<i32>, error: Option<&str>| DeliveryAttempt {
            id: uuid::Uuid::new_v4(),
            webhook_id: courier_core::WebhookId::new(),
            generation: 1,
            attempt_number: 1,
            response_status: status,
            response_body: status.map(|_| "body".to_string()),
            error_message: error.map(str::to_string),
            duration_ms: 10,
            attempted_at: chrono::Utc::now(),
        };
        let verdict = |attempt: DeliveryAttempt| classify_failure(recorded_failure(&attempt).as_ref());

        assert_eq!(verdict(recorded(Some(200), None)), Classification::Success);
        assert_eq!(verdict(recorded(Some(503), Some("server error"))), Classification::Retryable);
        assert_eq!(verdict(recorded(Some(429), Some("rate limited"))), Classification::Retryable);
        assert_eq!(verdict(recorded(Some(410), Some("client error"))), Classification::Terminal);
        assert_eq!(verdict(recorded(None, Some("connection refused"))), Classification::Retryable);

        let gone = recorded_failure(&recorded(Some(410), Some("client error")));
        assert_eq!(gone.and_then(|e| e.status_code()), Some(410));
    }

    #[test]
    fn profile_round_trip_preserves_schedule() {
        let policy = RetryPolicy::accelerated();
        let rebuilt = RetryPolicy::from_profile(policy.profile(), RetryPolicy::DEFAULT_MAX_DELAY);
        assert_eq!(rebuilt, policy);
    }
}
