//! Property-based tests for queue exclusivity and retry scheduling.

#![allow(clippy::unwrap_used)]

use std::{collections::HashSet, sync::Arc, time::Duration};

use courier_core::{TestClock, Webhook};
use courier_delivery::{
    queue::JobQueue,
    retry::{BackoffStrategy, Classification, RetryDecision, RetryPolicy},
    storage::memory::InMemoryStore,
};
use proptest::prelude::*;
use serde_json::json;

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (
        1u32..10,
        1u64..5_000,
        prop_oneof![Just(BackoffStrategy::Exponential), Just(BackoffStrategy::Fixed)],
        1u64..7_200,
    )
        .prop_map(|(max_attempts, base_ms, backoff_strategy, max_secs)| RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(max_secs),
            backoff_strategy,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Concurrent lease calls never hand the same job to two owners.
    #[test]
    fn concurrent_leases_are_exclusive(jobs in 1usize..30, workers in 2usize..12) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(InMemoryStore::new(Arc::new(TestClock::new())));
            for n in 0..jobs {
                let id = store.insert_webhook(Webhook::new("http://example.test", json!({"n": n}))).await;
                store.enqueue(id, RetryPolicy::standard().profile()).await.unwrap();
            }

            let mut handles = Vec::new();
            for w in 0..workers {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    let mut leased = Vec::new();
                    while let Some(lease) =
                        store.lease(&format!("worker-{w}"), Duration::from_secs(60)).await.unwrap()
                    {
                        leased.push(lease.webhook_id);
                    }
                    leased
                }));
            }

            let mut seen = HashSet::new();
            let mut total = 0;
            for handle in handles {
                for id in handle.await.unwrap() {
                    total += 1;
                    prop_assert!(seen.insert(id), "job leased twice");
                }
            }
            prop_assert_eq!(total, jobs);

            let counts = store.counts().await.unwrap();
            prop_assert_eq!(counts.active, jobs as i64);
            Ok(())
        })?;
    }

    /// Delays never exceed the cap and never shrink as attempts grow.
    #[test]
    fn delays_are_capped_and_monotonic(policy in policy_strategy()) {
        let mut previous = Duration::ZERO;
        for attempts_made in 0..40u32 {
            let delay = policy.delay_for(attempts_made);
            prop_assert!(delay <= policy.max_delay);
            prop_assert!(delay >= previous);
            if policy.backoff_strategy == BackoffStrategy::Fixed {
                prop_assert_eq!(delay, policy.base_delay.min(policy.max_delay));
            }
            previous = delay;
        }
    }

    /// A retryable failure is retried exactly until the attempt ceiling.
    #[test]
    fn retryable_failures_give_up_at_the_ceiling(policy in policy_strategy()) {
        let mut retries = 0;
        for attempts_made in 0..policy.max_attempts {
            match policy.decide(attempts_made, Classification::Retryable, None) {
                RetryDecision::Retry { .. } => retries += 1,
                RetryDecision::GiveUp { reason } => {
                    prop_assert_eq!(reason, "Exhausted all retry attempts");
                    prop_assert_eq!(attempts_made + 1, policy.max_attempts);
                },
                RetryDecision::Deliver => prop_assert!(false, "failure treated as success"),
            }
        }
        prop_assert_eq!(retries, policy.max_attempts - 1);
    }

    /// Success and terminal outcomes ignore the attempt count.
    #[test]
    fn success_and_terminal_ignore_attempts(policy in policy_strategy(), attempts_made in 0u32..20) {
        prop_assert_eq!(
            policy.decide(attempts_made, Classification::Success, None),
            RetryDecision::Deliver
        );
        let terminal = policy.decide(attempts_made, Classification::Terminal, None);
        prop_assert!(matches!(terminal, RetryDecision::GiveUp { .. }), "terminal must give up");
    }

    /// Stored profiles rebuild the same policy.
    #[test]
    fn profile_round_trips_through_job_columns(policy in policy_strategy()) {
        let rebuilt = RetryPolicy::from_profile(policy.profile(), policy.max_delay);
        prop_assert_eq!(rebuilt, policy);
    }
}
