//! Integration tests for the delivery worker.
//!
//! Drives single workers against the in-memory backend and a wiremock
//! endpoint, with a test clock controlling backoff visibility and lease
//! expiry.

#![allow(clippy::unwrap_used)]

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use courier_core::{
    signing::canonical_json, Clock, DeliveryAttempt, Signer, TestClock, Webhook, WebhookId,
    WebhookStatus,
};
use courier_delivery::{
    client::DeliveryClient,
    queue::JobQueue,
    retry::RetryPolicy,
    storage::{memory::InMemoryStore, DeliveryStorage},
    worker::{DeliveryConfig, DeliveryWorker, EngineStats, WorkerContext},
};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const SECRET: &str = "worker-test-secret";

struct Harness {
    store: Arc<InMemoryStore>,
    clock: TestClock,
    ctx: WorkerContext,
    worker: DeliveryWorker,
}

impl Harness {
    fn new() -> Self {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryStore::new(Arc::new(clock.clone())));
        let config = DeliveryConfig {
            worker_count: 1,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let ctx = WorkerContext {
            queue: store.clone(),
            storage: store.clone(),
            client: Arc::new(DeliveryClient::new(config.client_config.clone()).unwrap()),
            config,
            signer: Arc::new(Signer::new(SECRET).unwrap()),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            clock: Arc::new(clock.clone()),
        };
        let worker = DeliveryWorker::new(0, "test-worker-0", ctx.clone(), CancellationToken::new());

        Self { store, clock, ctx, worker }
    }

    async fn webhook(&self, url: String, policy: &RetryPolicy) -> WebhookId {
        let id = self.store.insert_webhook(Webhook::new(url, json!({"event": "order.created"}))).await;
        self.store.enqueue(id, policy.profile()).await.unwrap();
        id
    }

    /// Processes one job, then moves time past any backoff delay.
    async fn round(&self) -> bool {
        let processed = self.worker.process_next().await.unwrap();
        self.clock.advance(Duration::from_secs(60));
        processed
    }

    async fn stats(&self) -> EngineStats {
        self.ctx.stats.read().await.clone()
    }
}

async fn endpoint(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hook"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn successful_delivery_marks_webhook_delivered() {
    let h = Harness::new();
    let server = endpoint(200).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;

    assert!(h.round().await);

    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Delivered);
    assert!(h.store.job(id).await.is_none());

    let attempts = h.store.find_attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].response_status, Some(200));
    assert!(attempts[0].error_message.is_none());

    let stats = h.stats().await;
    assert_eq!(stats.successful_deliveries, 1);
    assert_eq!(stats.jobs_processed, 1);
    assert_eq!(stats.in_flight_deliveries, 0);
}

#[tokio::test]
async fn empty_queue_reports_no_work() {
    let h = Harness::new();
    assert!(!h.worker.process_next().await.unwrap());
    assert_eq!(h.stats().await.jobs_processed, 0);
}

#[tokio::test]
async fn server_errors_exhaust_attempts_into_dead_letter_queue() {
    let h = Harness::new();
    let server = endpoint(503).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;

    for _ in 0..5 {
        assert!(h.round().await);
    }
    assert!(!h.worker.process_next().await.unwrap(), "no job may remain after giving up");

    let attempts = h.store.find_attempts(id).await.unwrap();
    let numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert!(attempts.iter().all(|a| a.response_status == Some(503)));

    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Failed);
    let entry = h.store.find_dead_letter(id).await.unwrap().unwrap();
    assert_eq!(entry.reason, "Exhausted all retry attempts");
    assert_eq!(entry.final_error.as_deref(), Some("server error: HTTP 503"));

    let stats = h.stats().await;
    assert_eq!(stats.retries_scheduled, 4);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn retries_wait_for_the_backoff_delay() {
    let h = Harness::new();
    let server = endpoint(500).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;

    assert!(h.worker.process_next().await.unwrap());
    assert!(!h.worker.process_next().await.unwrap(), "job hidden during backoff");

    let counts = h.store.counts().await.unwrap();
    assert_eq!((counts.waiting, counts.active, counts.delayed), (0, 0, 1));

    h.clock.advance(Duration::from_millis(999));
    assert!(!h.worker.process_next().await.unwrap());

    h.clock.advance(Duration::from_millis(1));
    assert!(h.worker.process_next().await.unwrap());
    assert_eq!(h.store.find_attempts(id).await.unwrap().len(), 2);
    assert_eq!(h.store.job(id).await.unwrap().attempts_made, 2);
}

#[tokio::test]
async fn client_errors_are_terminal_after_one_attempt() {
    let h = Harness::new();
    let server = endpoint(404).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;

    assert!(h.round().await);

    assert_eq!(h.store.find_attempts(id).await.unwrap().len(), 1);
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Failed);
    let entry = h.store.find_dead_letter(id).await.unwrap().unwrap();
    assert_eq!(entry.reason, "Non-retryable HTTP 404 error");
    assert_eq!(h.stats().await.retries_scheduled, 0);
}

#[tokio::test]
async fn rate_limiting_is_retried() {
    let h = Harness::new();
    let server = endpoint(429).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::accelerated()).await;

    assert!(h.round().await);
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Pending);

    assert!(h.round().await);
    let entry = h.store.find_dead_letter(id).await.unwrap().unwrap();
    assert_eq!(entry.reason, "Exhausted all retry attempts");
    assert_eq!(h.store.find_attempts(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn unreachable_endpoint_is_retried_with_error_recorded() {
    let h = Harness::new();
    let id = h.webhook("http://127.0.0.1:1/hook".to_string(), &RetryPolicy::standard()).await;

    assert!(h.round().await);

    let attempts = h.store.find_attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].response_status, None);
    assert!(attempts[0].error_message.as_deref().unwrap().starts_with("network connection failed"));
    assert_eq!(h.store.job(id).await.unwrap().attempts_made, 1);
}

#[tokio::test]
async fn invalid_target_url_is_retried_until_exhausted() {
    let h = Harness::new();
    let id = h.webhook("not a url".to_string(), &RetryPolicy::standard()).await;

    assert!(h.round().await);
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Pending);
    assert_eq!(h.store.job(id).await.unwrap().attempts_made, 1);
    assert!(h.store.find_dead_letter(id).await.unwrap().is_none());

    for _ in 1..5 {
        assert!(h.round().await);
    }

    let attempts = h.store.find_attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 5);
    assert!(attempts.iter().all(|a| a.response_status.is_none()));
    assert!(attempts[0].error_message.as_deref().unwrap().contains("request not sent"));

    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Failed);
    let entry = h.store.find_dead_letter(id).await.unwrap().unwrap();
    assert_eq!(entry.reason, "Exhausted all retry attempts");
    assert_eq!(h.stats().await.retries_scheduled, 4);
}

#[tokio::test]
async fn mixed_outcomes_keep_attempt_numbers_gapless() {
    let h = Harness::new();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST")).respond_with(ResponseTemplate::new(204)).mount(&server).await;

    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;
    for _ in 0..3 {
        assert!(h.round().await);
    }

    let attempts = h.store.find_attempts(id).await.unwrap();
    let outcomes: Vec<(i32, Option<i32>)> =
        attempts.iter().map(|a| (a.attempt_number, a.response_status)).collect();
    assert_eq!(outcomes, vec![(1, Some(500)), (2, Some(429)), (3, Some(204))]);
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Delivered);
}

#[tokio::test]
async fn dead_letter_retry_starts_a_new_generation() {
    let h = Harness::new();
    let server = endpoint(410).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;
    assert!(h.round().await);

    let entry = h.store.find_dead_letter(id).await.unwrap().unwrap();
    server.reset().await;
    Mock::given(matchers::method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let job = h.store.retry_from_dlq(entry.id, RetryPolicy::standard().profile()).await.unwrap();
    assert_eq!(job.generation, 2);
    assert!(h.store.find_dead_letter(id).await.unwrap().is_none());

    assert!(h.round().await);

    let attempts = h.store.find_attempts(id).await.unwrap();
    let keys: Vec<(i32, i32)> = attempts.iter().map(|a| (a.generation, a.attempt_number)).collect();
    assert_eq!(keys, vec![(1, 1), (2, 1)]);
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Delivered);
}

#[tokio::test]
async fn missing_webhook_drops_the_job() {
    let h = Harness::new();
    let server = endpoint(200).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;
    let other = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;
    h.store.remove_webhook(id).await;

    assert!(h.round().await);
    assert!(h.round().await);

    assert!(h.store.job(id).await.is_none());
    assert!(h.store.find_attempts(id).await.unwrap().is_empty());
    assert_eq!(h.store.webhook(other).await.unwrap().status, WebhookStatus::Delivered);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(h.stats().await.dropped_jobs, 1);
}

#[tokio::test]
async fn settled_webhook_jobs_are_dropped_without_delivery() {
    let h = Harness::new();
    let server = endpoint(200).await;
    let mut webhook = Webhook::new(format!("{}/hook", server.uri()), json!({"n": 1}));
    webhook.status = WebhookStatus::Delivered;
    let id = h.store.insert_webhook(webhook).await;
    h.store.enqueue(id, RetryPolicy::standard().profile()).await.unwrap();

    assert!(h.round().await);

    assert!(h.store.job(id).await.is_none());
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(h.stats().await.dropped_jobs, 1);
}

#[tokio::test]
async fn stored_signature_is_sent_unchanged() {
    let h = Harness::new();
    let server = endpoint(200).await;
    let webhook = Webhook::new(format!("{}/hook", server.uri()), json!({"a": 1}))
        .with_signature("sha256=precomputed");
    let id = h.store.insert_webhook(webhook).await;
    h.store.enqueue(id, RetryPolicy::standard().profile()).await.unwrap();

    assert!(h.round().await);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].headers.get("x-webhook-signature").unwrap(), "sha256=precomputed");
}

#[tokio::test]
async fn missing_signature_is_computed_with_the_server_secret() {
    let h = Harness::new();
    let server = endpoint(200).await;
    let mut overrides = BTreeMap::new();
    overrides.insert("X-Tenant".to_string(), "acme".to_string());
    overrides.insert("X-Webhook-Attempt".to_string(), "99".to_string());
    let webhook =
        Webhook::new(format!("{}/hook", server.uri()), json!({"b": 2, "a": 1})).with_headers(overrides);
    let id = h.store.insert_webhook(webhook).await;
    h.store.enqueue(id, RetryPolicy::standard().profile()).await.unwrap();

    assert!(h.round().await);

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let signature = request.headers.get("x-webhook-signature").unwrap().to_str().unwrap();
    let signer = Signer::new(SECRET).unwrap();
    assert_eq!(request.body, canonical_json(&json!({"a": 1, "b": 2})).into_bytes());
    assert_eq!(request.body, br#"{"a":1,"b":2}"#.to_vec());
    assert!(signer.verify_bytes(&request.body, signature));
    assert!(signer.verify(&json!({"a": 1, "b": 2}), signature));

    assert_eq!(request.headers.get("x-tenant").unwrap(), "acme");
    assert_eq!(request.headers.get("x-webhook-attempt").unwrap(), "1");
    assert_eq!(request.headers.get("x-webhook-id").unwrap().to_str().unwrap(), id.to_string());
    assert_eq!(request.headers.get("content-type").unwrap(), "application/json");
}

#[tokio::test]
async fn persistence_failure_leaves_lease_for_the_sweeper() {
    let h = Harness::new();
    let server = endpoint(200).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;

    h.store.fail_next_write("connection reset").await;
    assert!(h.worker.process_next().await.is_err());

    let job = h.store.job(id).await.unwrap();
    assert!(job.is_leased(), "lease must be left to expire");
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Pending);
    assert!(!h.worker.process_next().await.unwrap(), "held lease blocks re-delivery");

    h.clock.advance(h.ctx.config.lease_duration + Duration::from_millis(1));
    assert_eq!(h.store.release_stalled(2).await.unwrap().released.len(), 1);

    assert!(h.round().await);
    let attempts = h.store.find_attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Delivered);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn stale_lease_holder_changes_nothing() {
    let h = Harness::new();
    let server = endpoint(200).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;

    let stale = h.store.lease("crashed-worker", h.ctx.config.lease_duration).await.unwrap().unwrap();
    h.clock.advance(h.ctx.config.lease_duration + Duration::from_secs(1));
    h.store.release_stalled(2).await.unwrap();

    assert!(h.round().await);
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Delivered);

    assert!(h.store.ack(&stale).await.unwrap_err().is_lease_lost());
    assert!(h.store.nack(&stale, Duration::ZERO).await.unwrap_err().is_lease_lost());
    assert!(h.store.find_dead_letter(id).await.unwrap().is_none());
}

#[tokio::test]
async fn recorded_but_unsettled_attempt_is_not_sent_again() {
    let h = Harness::new();
    let server = endpoint(200).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;

    // A worker records attempt 1 and dies before settling it.
    let stale = h.store.lease("crashed-worker", h.ctx.config.lease_duration).await.unwrap().unwrap();
    let recorded = DeliveryAttempt {
        id: Uuid::new_v4(),
        webhook_id: id,
        generation: stale.generation,
        attempt_number: 1,
        response_status: Some(503),
        response_body: Some("unavailable".to_string()),
        error_message: Some("server error: HTTP 503".to_string()),
        duration_ms: 40,
        attempted_at: h.clock.now_utc(),
    };
    assert!(h.store.record_attempt(&stale, recorded).await.unwrap());
    h.clock.advance(h.ctx.config.lease_duration + Duration::from_millis(1));
    assert_eq!(h.store.release_stalled(2).await.unwrap().released.len(), 1);

    assert!(h.round().await);
    assert!(server.received_requests().await.unwrap().is_empty());
    let job = h.store.job(id).await.unwrap();
    assert_eq!(job.attempts_made, 1);
    assert!(!job.is_leased());
    assert_eq!(h.stats().await.replayed_attempts, 1);
    assert_eq!(h.stats().await.retries_scheduled, 1);

    assert!(h.round().await);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Delivered);

    let ledger: Vec<(i32, Option<i32>)> = h
        .store
        .find_attempts(id)
        .await
        .unwrap()
        .iter()
        .map(|a| (a.attempt_number, a.response_status))
        .collect();
    assert_eq!(ledger, vec![(1, Some(503)), (2, Some(200))]);
}

#[tokio::test]
async fn recorded_terminal_outcome_dead_letters_without_resending() {
    let h = Harness::new();
    let server = endpoint(200).await;
    let id = h.webhook(format!("{}/hook", server.uri()), &RetryPolicy::standard()).await;

    let stale = h.store.lease("crashed-worker", h.ctx.config.lease_duration).await.unwrap().unwrap();
    let recorded = DeliveryAttempt {
        id: Uuid::new_v4(),
        webhook_id: id,
        generation: stale.generation,
        attempt_number: 1,
        response_status: Some(410),
        response_body: None,
        error_message: Some("client error: HTTP 410".to_string()),
        duration_ms: 15,
        attempted_at: h.clock.now_utc(),
    };
    assert!(h.store.record_attempt(&stale, recorded).await.unwrap());
    h.clock.advance(h.ctx.config.lease_duration + Duration::from_millis(1));
    h.store.release_stalled(2).await.unwrap();

    assert!(h.round().await);

    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(h.store.webhook(id).await.unwrap().status, WebhookStatus::Failed);
    let entry = h.store.find_dead_letter(id).await.unwrap().unwrap();
    assert_eq!(entry.reason, "Non-retryable HTTP 410 error");
    assert_eq!(entry.final_error.as_deref(), Some("client error: HTTP 410"));
    assert_eq!(h.store.find_attempts(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn lease_failure_is_reported_to_the_caller() {
    let h = Harness::new();
    h.store.fail_next_lease("database unavailable").await;

    let err = h.worker.process_next().await.unwrap_err();
    assert!(err.to_string().contains("database unavailable"));
}

#[tokio::test]
async fn worker_loop_drains_queue_until_cancelled() {
    let clock = TestClock::new();
    let store = Arc::new(InMemoryStore::new(Arc::new(clock.clone())));
    let server = endpoint(200).await;
    let config = DeliveryConfig { poll_interval: Duration::from_millis(5), ..Default::default() };
    let ctx = WorkerContext {
        queue: store.clone(),
        storage: store.clone(),
        client: Arc::new(DeliveryClient::new(config.client_config.clone()).unwrap()),
        config,
        signer: Arc::new(Signer::new(SECRET).unwrap()),
        stats: Arc::new(RwLock::new(EngineStats::default())),
        clock: Arc::new(clock.clone()),
    };

    let mut ids = Vec::new();
    for n in 0..3 {
        let id = store.insert_webhook(Webhook::new(format!("{}/hook", server.uri()), json!({"n": n}))).await;
        store.enqueue(id, RetryPolicy::standard().profile()).await.unwrap();
        ids.push(id);
    }

    let token = CancellationToken::new();
    let worker = DeliveryWorker::new(0, "loop-worker", ctx.clone(), token.clone());
    let handle = tokio::spawn(async move { worker.run().await });

    tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.stats.read().await.successful_deliveries < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    token.cancel();
    handle.await.unwrap().unwrap();

    for id in ids {
        assert_eq!(store.webhook(id).await.unwrap().status, WebhookStatus::Delivered);
    }
    assert!(store.counts().await.unwrap() == Default::default());
}
