//! HTTP transport for webhook delivery.
//!
//! The sender talks to the network only through `HttpTransport`, so tests
//! can substitute a scripted transport and production uses the pooled
//! reqwest client.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_AUDIT_SIZE: usize = 1024;

/// Configuration for the reqwest-backed transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound applied by the client itself. Per-request timeouts from
    /// webhook configs are applied on top of this.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: "hookrelay/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// Response as seen by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Canonical reason phrase for the status, empty if unknown.
    pub status_text: String,
    /// Response body, truncated for audit.
    pub body: String,
}

/// Failure that produced no HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// Connection or protocol failure.
    #[error("network error: {0}")]
    Network(String),
    /// Anything the transport could not classify.
    #[error("transport error: {0}")]
    Other(String),
}

/// Outbound HTTP POST.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    /// Posts `body` to `url` with `headers`, bounded by `timeout`.
    async fn post(
        &self,
        url: &str,
        body: Bytes,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// Pooled reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::HttpClient` if the client cannot be built
    /// with the provided settings.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| DeliveryError::HttpClient {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { client })
    }

    /// Builds a transport with default settings.
    ///
    /// # Errors
    ///
    /// Returns error if the client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&ClientConfig::default())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(
        &self,
        url: &str,
        body: Bytes,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let span = info_span!("webhook_post", url = %url);

        async move {
            let mut request = self.client.post(url).body(body).timeout(timeout);
            for (key, value) in headers {
                if !is_managed_header(key) {
                    request = request.header(key, value);
                }
            }

            let response = request.send().await.map_err(|e| {
                warn!(error = %e, "request failed");
                classify(&e)
            })?;

            let status = response.status();
            debug!(status = status.as_u16(), "received response");

            let body = match response.bytes().await {
                Ok(bytes) => truncate_body(&bytes),
                Err(e) => {
                    warn!(error = %e, "failed to read response body");
                    format!("[failed to read response body: {e}]")
                },
            };

            Ok(TransportResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn classify(error: &reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Network(format!("connection failed: {error}"))
    } else if error.is_request() || error.is_redirect() || error.is_body() {
        TransportError::Network(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() > MAX_RESPONSE_BODY_SIZE {
        let suffix = "... (truncated)";
        let max_content = MAX_AUDIT_SIZE - suffix.len();
        let truncated = String::from_utf8_lossy(&bytes[..max_content]);
        format!("{truncated}{suffix}")
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Headers the client controls itself and never copies from configuration.
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

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn json_headers() -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("X-Token".to_string(), "secret".to_string());
        headers.insert("Host".to_string(), "evil.example.com".to_string());
        headers
    }

    #[tokio::test]
    async fn posts_body_and_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::header("x-token", "secret"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::body_string(r#"{"ok":true}"#))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::with_defaults().unwrap();
        let response = transport
            .post(
                &format!("{}/hook", server.uri()),
                Bytes::from_static(br#"{"ok":true}"#),
                &json_headers(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 204);
        assert_eq!(response.status_text, "No Content");
    }

    #[tokio::test]
    async fn error_status_is_a_response_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::with_defaults().unwrap();
        let response = transport
            .post(&server.uri(), Bytes::new(), &HashMap::new(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(response.status_text, "Service Unavailable");
        assert_eq!(response.body, "down");
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::with_defaults().unwrap();
        let result = transport
            .post(&server.uri(), Bytes::new(), &HashMap::new(), Duration::from_millis(50))
            .await;

        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let transport = ReqwestTransport::with_defaults().unwrap();
        let result = transport
            .post("http://127.0.0.1:1/hook", Bytes::new(), &HashMap::new(), Duration::from_secs(2))
            .await;

        assert!(matches!(result, Err(TransportError::Network(_))));
    }

    #[test]
    fn oversized_bodies_are_truncated() {
        let body = vec![b'a'; MAX_RESPONSE_BODY_SIZE + 1];
        let truncated = truncate_body(&body);

        assert_eq!(truncated.len(), MAX_AUDIT_SIZE);
        assert!(truncated.ends_with("... (truncated)"));
    }

    #[test]
    fn managed_headers_are_case_insensitive() {
        assert!(is_managed_header("Host"));
        assert!(is_managed_header("CONTENT-LENGTH"));
        assert!(!is_managed_header("Authorization"));
        assert!(!is_managed_header("Content-Type"));
    }
}
