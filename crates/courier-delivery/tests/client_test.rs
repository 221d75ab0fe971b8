//! Integration tests for the HTTP delivery client.
//!
//! Covers timeouts, redirect limits, unsendable requests and response
//! excerpting against a wiremock endpoint.

#![allow(clippy::unwrap_used)]

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use courier_core::WebhookId;
use courier_delivery::{
    client::{ClientConfig, DeliveryClient, DeliveryRequest},
    retry::{classify, Classification},
    DeliveryError,
};
use serde_json::json;
use uuid::Uuid;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn request(url: String) -> DeliveryRequest {
    DeliveryRequest {
        attempt_id: Uuid::new_v4(),
        webhook_id: WebhookId::new(),
        url,
        body: Bytes::from(json!({"event": "test"}).to_string()),
        signature: "sha256=00".to_string(),
        headers: BTreeMap::new(),
        attempt_number: 1,
    }
}

#[tokio::test]
async fn slow_endpoint_times_out_as_retryable() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let config = ClientConfig { timeout: Duration::from_millis(100), ..Default::default() };
    let client = DeliveryClient::new(config).unwrap();

    let result = client.deliver(request(server.uri())).await;

    assert!(matches!(result, Err(DeliveryError::Timeout { .. })), "got {result:?}");
    assert_eq!(classify(&result), Classification::Retryable);
}

#[tokio::test]
async fn redirect_loops_are_retryable() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(
            ResponseTemplate::new(307).insert_header("location", format!("{}/loop", server.uri())),
        )
        .mount(&server)
        .await;

    let client = DeliveryClient::new(ClientConfig { max_redirects: 2, ..Default::default() }).unwrap();
    let result = client.deliver(request(server.uri())).await;

    assert!(matches!(result, Err(DeliveryError::NetworkError { .. })), "got {result:?}");
    assert_eq!(classify(&result), Classification::Retryable);
}

#[tokio::test]
async fn long_response_bodies_are_truncated() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("e".repeat(5_000)))
        .mount(&server)
        .await;

    let client = DeliveryClient::with_defaults().unwrap();
    let response = client.deliver(request(server.uri())).await.unwrap();

    assert_eq!(response.status_code, 500);
    assert_eq!(response.body.chars().count(), 1_000);
    assert!(!response.is_success);
}

#[tokio::test]
async fn user_agent_and_body_are_sent() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::header("user-agent", "Courier-Webhook-Delivery/1.0"))
        .and(matchers::body_json(json!({"event": "test"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = DeliveryClient::with_defaults().unwrap();
    let response = client.deliver(request(server.uri())).await.unwrap();

    assert_eq!(response.status_code, 202);
    assert!(response.is_success);
    assert_eq!(classify(&Ok(response)), Classification::Success);
}

#[tokio::test]
async fn malformed_url_is_a_retryable_network_error() {
    let client = DeliveryClient::with_defaults().unwrap();
    let result = client.deliver(request("not a url".to_string())).await;

    assert!(matches!(result, Err(DeliveryError::NetworkError { .. })), "got {result:?}");
    assert_eq!(classify(&result), Classification::Retryable);
}

#[tokio::test]
async fn unsendable_signature_is_retryable_and_never_sent() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = DeliveryClient::with_defaults().unwrap();
    let mut bad = request(server.uri());
    bad.signature = "sha256=ab\ncd".to_string();
    let result = client.deliver(bad).await;

    assert!(matches!(result, Err(DeliveryError::NetworkError { .. })), "got {result:?}");
    assert_eq!(classify(&result), Classification::Retryable);
    assert!(server.received_requests().await.unwrap().is_empty());
}
