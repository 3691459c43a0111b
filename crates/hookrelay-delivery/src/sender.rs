//! Webhook sender: one HTTP attempt, classified into a `DeliveryResult`.
//!
//! `send_webhook` never fails. Every outcome, including timeouts and
//! transport errors, resolves to a result the processor can branch on.

use std::{collections::HashMap, sync::Arc, time::Instant};

use bytes::Bytes;
use hookrelay_core::{Delivery, WebhookConfig};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    client::{HttpTransport, TransportError},
    metrics::{MetricsSink, SENDER_REQUESTS_TOTAL, SENDER_RESPONSE_TIME_MS},
};

/// Largest per-request timeout a webhook may configure.
pub const MAX_WEBHOOK_TIMEOUT_MS: u64 = 300_000;

/// Outcome of one send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// True for a 2xx response.
    pub success: bool,
    /// Status code when a response was received.
    pub status_code: Option<u16>,
    /// Wall time spent on the request.
    pub response_time_ms: u64,
    /// Classified failure text.
    pub error: Option<String>,
}

impl DeliveryResult {
    fn succeeded(status_code: u16, response_time_ms: u64) -> Self {
        Self { success: true, status_code: Some(status_code), response_time_ms, error: None }
    }

    fn failed(status_code: Option<u16>, response_time_ms: u64, error: impl Into<String>) -> Self {
        Self { success: false, status_code, response_time_ms, error: Some(error.into()) }
    }
}

/// Result of `validate_webhook_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// True when `errors` is empty.
    pub is_valid: bool,
    /// Every problem found, in check order.
    pub errors: Vec<String>,
}

/// Checks that a configuration can be sent to.
pub fn validate_webhook_config(config: &WebhookConfig) -> ValidationReport {
    let mut errors = Vec::new();

    if config.url.trim().is_empty() {
        errors.push("URL is required".to_string());
    } else {
        match reqwest::Url::parse(&config.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {},
            Ok(url) => {
                errors.push(format!("URL scheme must be http or https, got {}", url.scheme()));
            },
            Err(e) => errors.push(format!("Invalid URL format: {e}")),
        }
    }

    if config.timeout_ms == 0 || config.timeout_ms > MAX_WEBHOOK_TIMEOUT_MS {
        errors.push(format!("Timeout must be between 1 and {MAX_WEBHOOK_TIMEOUT_MS}ms"));
    }

    if config.retry_attempts == 0 {
        errors.push("Retry attempts must be at least 1".to_string());
    }

    let mut names: Vec<_> = config.headers.keys().collect();
    names.sort();
    for name in names {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(format!("Invalid header name: {name:?}"));
        } else if HeaderValue::from_str(&config.headers[name]).is_err() {
            errors.push(format!("Invalid value for header {name}"));
        }
    }

    ValidationReport { is_valid: errors.is_empty(), errors }
}

/// Sends deliveries over an `HttpTransport`.
#[derive(Clone)]
pub struct WebhookSender {
    transport: Arc<dyn HttpTransport>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for WebhookSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSender").field("metrics", &self.metrics).finish_non_exhaustive()
    }
}

impl WebhookSender {
    /// Creates a sender.
    pub fn new(transport: Arc<dyn HttpTransport>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { transport, metrics }
    }

    /// Posts the delivery's payload to the configured endpoint.
    pub async fn send_webhook(
        &self,
        delivery: &Delivery,
        config: &WebhookConfig,
    ) -> DeliveryResult {
        let start = Instant::now();
        let headers = merge_headers(&config.headers);

        let body = match serde_json::to_vec(&delivery.payload) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(delivery_id = %delivery.id, error = %e, "payload could not be serialized");
                return self.finish(delivery, config, start, Outcome::Unknown, None);
            },
        };

        let timeout = config.timeout();
        let sent = tokio::time::timeout(
            timeout,
            self.transport.post(&config.url, body, &headers, timeout),
        )
        .await;

        match sent {
            Ok(Ok(response)) if (200..300).contains(&response.status) => {
                self.finish(delivery, config, start, Outcome::Success, Some(response.status))
            },
            Ok(Ok(response)) => {
                let message = format!("HTTP {}: {}", response.status, response.status_text);
                self.finish(
                    delivery,
                    config,
                    start,
                    Outcome::HttpError(message),
                    Some(response.status),
                )
            },
            Err(_) | Ok(Err(TransportError::Timeout)) => {
                self.finish(delivery, config, start, Outcome::Timeout, None)
            },
            Ok(Err(TransportError::Network(message))) => {
                self.finish(delivery, config, start, Outcome::Network(message), None)
            },
            Ok(Err(TransportError::Other(_))) => {
                self.finish(delivery, config, start, Outcome::Unknown, None)
            },
        }
    }

    fn finish(
        &self,
        delivery: &Delivery,
        config: &WebhookConfig,
        start: Instant,
        outcome: Outcome,
        status_code: Option<u16>,
    ) -> DeliveryResult {
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let webhook_id = delivery.webhook_id.to_string();

        self.metrics.increment_counter(SENDER_REQUESTS_TOTAL, &[("outcome", outcome.label())]);
        #[allow(clippy::cast_precision_loss)]
        self.metrics.record_gauge(
            SENDER_RESPONSE_TIME_MS,
            elapsed_ms as f64,
            &[("webhook_id", webhook_id.as_str())],
        );

        let result = match outcome {
            Outcome::Success => DeliveryResult::succeeded(status_code.unwrap_or(200), elapsed_ms),
            Outcome::HttpError(message) => DeliveryResult::failed(status_code, elapsed_ms, message),
            Outcome::Timeout => DeliveryResult::failed(
                None,
                elapsed_ms,
                format!("Request timeout after {}ms", config.timeout_ms),
            ),
            Outcome::Network(message) if message.trim().is_empty() => {
                DeliveryResult::failed(None, elapsed_ms, "Network error")
            },
            Outcome::Network(message) => DeliveryResult::failed(None, elapsed_ms, message),
            Outcome::Unknown => DeliveryResult::failed(None, elapsed_ms, "Unknown error"),
        };

        debug!(
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            success = result.success,
            status = ?result.status_code,
            response_time_ms = elapsed_ms,
            "webhook send finished"
        );
        result
    }
}

enum Outcome {
    Success,
    HttpError(String),
    Timeout,
    Network(String),
    Unknown,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HttpError(_) => "http_error",
            Self::Timeout => "timeout",
            Self::Network(_) => "network_error",
            Self::Unknown => "unknown_error",
        }
    }
}

/// Configured headers layered over the JSON content type. A configured
/// content type in any letter case replaces the default.
fn merge_headers(configured: &HashMap<String, String>) -> HashMap<String, String> {
    let mut headers = HashMap::with_capacity(configured.len() + 1);
    if !configured.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
        headers.insert("Content-Type".to_string(), "application/json".to_string());
    }
    headers.extend(configured.iter().map(|(k, v)| (k.clone(), v.clone())));
    headers
}
