//! Builders for webhook configurations and incoming deliveries.

use hookrelay_core::{
    NewDelivery, SubscriptionId, WebhookConfig, WebhookConfigRecord, WebhookFormat, WebhookId,
};
use serde_json::{json, Value};

/// Builder for test webhook configurations.
#[derive(Debug, Clone)]
pub struct WebhookConfigBuilder {
    config: WebhookConfig,
}

impl WebhookConfigBuilder {
    /// Config with a fresh ID and the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { config: WebhookConfig::new(WebhookId::new(), url) }
    }

    /// Config pointing at a placeholder endpoint with a short timeout.
    pub fn with_defaults() -> Self {
        Self::new("https://hooks.example.com/webhook").timeout_ms(5_000)
    }

    /// Sets the webhook ID.
    #[must_use]
    pub fn id(mut self, id: WebhookId) -> Self {
        self.config.id = id;
        self
    }

    /// Sets the destination URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Sets the payload format.
    #[must_use]
    pub fn format(mut self, format: WebhookFormat) -> Self {
        self.config.format = format;
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    /// Sets the retry attempts new deliveries inherit.
    #[must_use]
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    /// Finished configuration.
    pub fn build(self) -> WebhookConfig {
        self.config
    }

    /// Finished configuration as a stored record.
    pub fn record(self) -> WebhookConfigRecord {
        WebhookConfigRecord::from(&self.config)
    }
}

/// Builder for deliveries handed to the processor.
#[derive(Debug, Clone)]
pub struct DeliveryBuilder {
    subscription_id: SubscriptionId,
    webhook_id: WebhookId,
    event: Value,
    payload: Value,
    max_attempts: Option<u32>,
}

impl DeliveryBuilder {
    /// Delivery for `webhook_id` with a sample transfer event.
    pub fn new(webhook_id: WebhookId) -> Self {
        Self {
            subscription_id: SubscriptionId::new(),
            webhook_id,
            event: json!({
                "name": "Transfer",
                "chain": "ethereum",
                "block_number": 19_000_000,
            }),
            payload: json!({"content": "Transfer of 5 ETH"}),
            max_attempts: None,
        }
    }

    /// Sets the originating subscription.
    #[must_use]
    pub fn subscription(mut self, id: SubscriptionId) -> Self {
        self.subscription_id = id;
        self
    }

    /// Sets the upstream event.
    #[must_use]
    pub fn event(mut self, event: Value) -> Self {
        self.event = event;
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets an explicit attempt ceiling.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Finished delivery input.
    pub fn build(self) -> NewDelivery {
        NewDelivery {
            subscription_id: self.subscription_id,
            webhook_id: self.webhook_id,
            event: self.event,
            payload: self.payload,
            max_attempts: self.max_attempts,
        }
    }
}
