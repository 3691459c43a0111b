//! Test infrastructure for deterministic delivery testing.
//!
//! Wires a `QueueProcessor` to in-memory storage, a controllable clock, a
//! recording metrics sink and a wiremock server, so integration tests can
//! drive the full delivery pipeline without a database.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookrelay_core::{Delivery, DeliveryId, WebhookConfig};
use hookrelay_delivery::{
    client::{ClientConfig, HttpTransport, ReqwestTransport},
    metrics::InMemoryMetrics,
    storage::memory::InMemoryStorage,
    ProcessorConfig, ProcessorDeps, QueueConfig, QueueProcessor,
};

pub mod fixtures;
pub mod http;

pub use fixtures::{DeliveryBuilder, WebhookConfigBuilder};
pub use hookrelay_core::TestClock;
pub use http::{MockEndpoint, MockResponse};

/// In-memory environment for driving a `QueueProcessor` end to end.
pub struct TestEnv {
    /// HTTP mock server standing in for webhook endpoints
    pub http_mock: wiremock::MockServer,
    /// Deterministic clock shared by every component
    pub clock: TestClock,
    /// Backing store for deliveries, configs and dead letters
    pub storage: InMemoryStorage,
    /// Recorded counters and gauges
    pub metrics: InMemoryMetrics,
}

impl TestEnv {
    /// Starts a fresh mock server and empty storage.
    pub async fn new() -> Self {
        init_tracing();

        Self {
            http_mock: wiremock::MockServer::start().await,
            clock: TestClock::new(),
            storage: InMemoryStorage::new(),
            metrics: InMemoryMetrics::new(),
        }
    }

    /// Base URL of the mock server.
    pub fn base_url(&self) -> String {
        self.http_mock.uri()
    }

    /// Builder for a webhook configuration pointing at `path` on the mock
    /// server.
    pub fn webhook(&self, path: &str) -> WebhookConfigBuilder {
        WebhookConfigBuilder::with_defaults().url(format!("{}{path}", self.base_url()))
    }

    /// Stores a webhook configuration directly, bypassing any processor.
    pub async fn add_webhook(&self, config: &WebhookConfig) {
        self.storage.add_webhook_config(config.into()).await;
    }

    /// Processor config tuned for tests: one worker and a short poll interval.
    pub fn processor_config() -> ProcessorConfig {
        ProcessorConfig {
            queue: QueueConfig {
                worker_count: 1,
                poll_interval: Duration::from_millis(10),
                ..QueueConfig::default()
            },
            ..ProcessorConfig::default()
        }
    }

    /// Builds a processor that sends real HTTP requests to the mock server.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn processor(&self, config: ProcessorConfig) -> Result<QueueProcessor> {
        let transport = ReqwestTransport::new(&ClientConfig::default())
            .context("failed to build HTTP transport")?;
        Ok(self.processor_with_transport(config, Arc::new(transport)))
    }

    /// Builds a processor over a caller-supplied transport.
    pub fn processor_with_transport(
        &self,
        config: ProcessorConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> QueueProcessor {
        let deps = ProcessorDeps::with_storage(
            self.storage.clone(),
            transport,
            Arc::new(self.metrics.clone()),
            Arc::new(self.clock.clone()),
        );
        QueueProcessor::new(config, deps)
    }

    /// Stored delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if no delivery has this ID.
    pub async fn delivery(&self, id: DeliveryId) -> Result<Delivery> {
        self.storage.delivery(id).await.with_context(|| format!("delivery {id} not found"))
    }

    /// Polls until `predicate` holds for the stored delivery, or fails after
    /// `timeout` of wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns error on timeout or if the delivery does not exist.
    pub async fn wait_for_delivery<F>(
        &self,
        id: DeliveryId,
        timeout: Duration,
        predicate: F,
    ) -> Result<Delivery>
    where
        F: Fn(&Delivery) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let delivery = self.delivery(id).await?;
            if predicate(&delivery) {
                return Ok(delivery);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "delivery {id} did not reach the expected state within {timeout:?}, last seen \
                     {} after {} attempts",
                    delivery.status,
                    delivery.attempts
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}
