//! HTTP client for webhook delivery.
//!
//! Builds the outbound POST, bounds it with a timeout and turns transport
//! failures into [`DeliveryError`]s. Any HTTP response, whatever its status,
//! comes back as a [`DeliveryResponse`]; classification happens in
//! [`crate::retry`].

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use courier_core::{signing::SIGNATURE_HEADER, WebhookId};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Response,
};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Header carrying the webhook id.
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-Id";

/// Header carrying the 1-based attempt number.
pub const WEBHOOK_ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for the whole request, body included.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Characters of the response body kept in the attempt log.
    pub response_excerpt_chars: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "Courier-Webhook-Delivery/1.0".to_string(),
            max_redirects: 3,
            response_excerpt_chars: 1000,
        }
    }
}

/// HTTP client shared by all workers.
///
/// Wraps a pooled `reqwest::Client`, so clones are cheap.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One outbound delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Identifier of this attempt, used for tracing.
    pub attempt_id: Uuid,
    /// Webhook being delivered.
    pub webhook_id: WebhookId,
    /// Destination URL.
    pub url: String,
    /// Serialized JSON payload.
    pub body: Bytes,
    /// Value of the signature header.
    pub signature: String,
    /// Header overrides from the webhook row.
    pub headers: BTreeMap<String, String>,
    /// 1-based attempt number.
    pub attempt_number: i32,
}

/// Response from a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body excerpt.
    pub body: String,
    /// Wall time of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs a webhook.
    ///
    /// # Errors
    ///
    /// Only failures without an HTTP response are errors, and all of them
    /// are retryable:
    /// - `Timeout` when the request exceeded the configured timeout
    /// - `NetworkError` for everything else, including unusable URLs,
    ///   redirect loops and header values that cannot be sent
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            webhook_id = %request.webhook_id,
            attempt_id = %request.attempt_id,
            url = %request.url,
            attempt_number = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");
            let start_time = std::time::Instant::now();

            let headers = build_headers(&request)?;
            let result =
                self.client.post(&request.url).headers(headers).body(request.body).send().await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), error = %e, "request failed");
                    return Err(self.transport_error(&e));
                },
            };

            let delivery_response = self.read_response(response, start_time).await;

            tracing::debug!(
                status_code = delivery_response.status_code,
                duration_ms = delivery_response.duration.as_millis(),
                "received response"
            );

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    fn transport_error(&self, e: &reqwest::Error) -> DeliveryError {
        if e.is_timeout() {
            DeliveryError::timeout(self.config.timeout.as_secs())
        } else if e.is_builder() {
            DeliveryError::network(format!("request not sent: {e}"))
        } else if e.is_redirect() {
            DeliveryError::network(format!("redirect limit exceeded: {e}"))
        } else if e.is_connect() {
            DeliveryError::network(format!("connection failed: {e}"))
        } else {
            DeliveryError::network(e.to_string())
        }
    }

    async fn read_response(
        &self,
        response: Response,
        start_time: std::time::Instant,
    ) -> DeliveryResponse {
        let status_code = response.status().as_u16();
        let is_success = response.status().is_success();

        let body = match response.bytes().await {
            Ok(bytes) => excerpt(&String::from_utf8_lossy(&bytes), self.config.response_excerpt_chars),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read response body");
                format!("[failed to read response body: {e}]")
            },
        };

        DeliveryResponse { status_code, body, duration: start_time.elapsed(), is_success }
    }
}

/// Assembles outbound headers.
///
/// Later inserts replace earlier ones: content type and signature first,
/// then the webhook's overrides, then the delivery metadata. Managed headers
/// and overrides that are not valid HTTP headers are skipped.
fn build_headers(request: &DeliveryRequest) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static("x-webhook-signature"),
        HeaderValue::from_str(&request.signature).map_err(|e| {
            DeliveryError::network(format!("request not sent, invalid {SIGNATURE_HEADER}: {e}"))
        })?,
    );

    for (key, value) in &request.headers {
        if is_managed_header(key) {
            continue;
        }
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            },
            _ => tracing::warn!(header = %key, "skipping invalid header override"),
        }
    }

    headers.insert(HeaderName::from_static("x-webhook-id"), header_value(request.webhook_id)?);
    headers.insert(
        HeaderName::from_static("x-webhook-attempt"),
        header_value(request.attempt_number)?,
    );

    Ok(headers)
}

fn header_value(value: impl ToString) -> Result<HeaderValue> {
    HeaderValue::from_str(&value.to_string())
        .map_err(|e| DeliveryError::internal(format!("invalid metadata header: {e}")))
}

/// Checks if a header is managed by the transport and must not be
/// overridden by the webhook.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// First `max_chars` characters of `body`.
fn excerpt(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((cut, _)) => body[..cut].to_string(),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn create_test_request(url: String) -> DeliveryRequest {
        let mut headers = BTreeMap::new();
        headers.insert("X-Original-Header".to_string(), "test-value".to_string());

        DeliveryRequest {
            attempt_id: Uuid::new_v4(),
            webhook_id: WebhookId::new(),
            url,
            body: Bytes::from(r#"{"event":"test"}"#),
            signature: "sha256=abc123".to_string(),
            headers,
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request(format!("{}/webhook", mock_server.uri()));

        let response = client.deliver(request).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
    }

    #[tokio::test]
    async fn error_statuses_are_responses() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request(format!("{}/webhook", mock_server.uri()));

        let response = client.deliver(request).await.unwrap();
        assert_eq!(response.status_code, 404);
        assert_eq!(response.body, "Not Found");
        assert!(!response.is_success);
    }

    #[tokio::test]
    async fn metadata_headers_added() {
        let mock_server = MockServer::start().await;
        let request = create_test_request(format!("{}/webhook", mock_server.uri()));

        Mock::given(matchers::method("POST"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header("X-Webhook-Signature", "sha256=abc123"))
            .and(matchers::header("X-Webhook-Id", request.webhook_id.to_string().as_str()))
            .and(matchers::header("X-Webhook-Attempt", "1"))
            .and(matchers::header("X-Original-Header", "test-value"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request).await.unwrap();
        assert_eq!(response.status_code, 200);
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request("http://127.0.0.1:1/webhook".to_string());

        let err = client.deliver(request).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NetworkError { .. }), "got {err:?}");
        assert!(err.is_retryable());
    }

    #[test]
    fn managed_headers_identified() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("content-length"));
        assert!(is_managed_header("Host"));
        assert!(is_managed_header("TRANSFER-ENCODING"));

        assert!(!is_managed_header("X-Custom-Header"));
        assert!(!is_managed_header("Authorization"));
    }

    #[test]
    fn overrides_replace_defaults_but_not_metadata() {
        let mut request = create_test_request("http://localhost/webhook".to_string());
        request.headers.insert("Content-Type".into(), "application/cloudevents+json".into());
        request.headers.insert("X-Webhook-Attempt".into(), "99".into());
        request.headers.insert("Host".into(), "evil.example".into());
        request.headers.insert("bad header".into(), "x".into());

        let headers = build_headers(&request).unwrap();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/cloudevents+json");
        assert_eq!(headers.get("x-webhook-attempt").unwrap(), "1");
        assert!(headers.get("host").is_none());
        assert_eq!(headers.get_all(CONTENT_TYPE).iter().count(), 1);
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé");
        assert_eq!(excerpt("short", 1000), "short");
        assert_eq!(excerpt(&"x".repeat(1500), 1000).len(), 1000);
    }
}
