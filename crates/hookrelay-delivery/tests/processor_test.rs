//! Integration tests for the queue processor running its worker pool.
//!
//! Each test wires the processor to in-memory storage, a controllable clock
//! and a wiremock endpoint, then observes stored delivery state.

#![allow(clippy::unwrap_used)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use hookrelay_core::DeliveryStatus;
use hookrelay_delivery::{
    client::{ClientConfig, HttpTransport, ReqwestTransport, TransportError, TransportResponse},
    dead_letter::REASON_MAX_ATTEMPTS,
    DeliveryError, ProcessorConfig, ProcessorState, QueueConfig,
};
use hookrelay_testing::{http, DeliveryBuilder, MockEndpoint, MockResponse, TestEnv};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn running_processor_delivers_queued_work() -> Result<()> {
    let env = TestEnv::new().await;
    MockEndpoint::new("/hooks/ok").expect(5).mount(&env.http_mock).await;
    let config = env.webhook("/hooks/ok").build();
    env.add_webhook(&config).await;

    let processor = env.processor(ProcessorConfig {
        queue: QueueConfig {
            worker_count: 3,
            poll_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        },
        ..TestEnv::processor_config()
    })?;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(processor.enqueue(DeliveryBuilder::new(config.id).build()).await?);
    }

    processor.start().await?;
    for id in ids {
        let delivery = env
            .wait_for_delivery(id, WAIT, |d| d.status == DeliveryStatus::Completed)
            .await?;
        assert_eq!(delivery.attempts, 1);
    }
    processor.stop().await?;

    let stats = processor.stats().await?;
    assert_eq!(stats.successful_deliveries, 5);
    assert_eq!(stats.total_processed, 5);
    assert_eq!(stats.current_queue_size, 0);
    assert!(!stats.is_running);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered_and_replayable() -> Result<()> {
    let env = TestEnv::new().await;
    MockEndpoint::new("/hooks/flaky")
        .respond(MockResponse::status(503))
        .up_to(2)
        .mount(&env.http_mock)
        .await;
    MockEndpoint::new("/hooks/flaky").mount(&env.http_mock).await;
    let config = env.webhook("/hooks/flaky").retry_attempts(2).build();
    env.add_webhook(&config).await;

    let processor = env.processor(TestEnv::processor_config())?;
    let id = processor.enqueue(DeliveryBuilder::new(config.id).build()).await?;

    processor.process_next().await?;
    env.clock.advance(Duration::from_secs(1));
    processor.process_next().await?;

    let delivery = env.delivery(id).await?;
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 2);

    let stats = processor.dead_letter_stats().await?;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_reason.get(REASON_MAX_ATTEMPTS), Some(&1));

    let entry = processor.list_dead_letters(1).await?.remove(0);
    assert_eq!(entry.last_error, "HTTP 503: Service Unavailable");

    let replayed = processor.retry_dead_letter(entry.id).await?;
    processor.process_next().await?;

    let delivery = env.delivery(replayed).await?;
    assert_eq!(delivery.status, DeliveryStatus::Completed);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(processor.dead_letter_stats().await?.total, 0);
    Ok(())
}

#[tokio::test]
async fn stop_waits_for_in_flight_delivery() -> Result<()> {
    let env = TestEnv::new().await;
    MockEndpoint::new("/hooks/slow")
        .respond(MockResponse::Delayed { status: 200, delay: Duration::from_millis(300) })
        .mount(&env.http_mock)
        .await;
    let config = env.webhook("/hooks/slow").build();
    env.add_webhook(&config).await;
    let processor = env.processor(TestEnv::processor_config())?;
    let id = processor.enqueue(DeliveryBuilder::new(config.id).build()).await?;

    processor.start().await?;
    env.wait_for_delivery(id, WAIT, |d| d.status == DeliveryStatus::Processing).await?;
    processor.stop().await?;

    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert_eq!(env.delivery(id).await?.status, DeliveryStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn cached_configuration_is_used_until_refreshed() -> Result<()> {
    let env = TestEnv::new().await;
    MockEndpoint::new("/hooks/old").expect(1).mount(&env.http_mock).await;
    MockEndpoint::new("/hooks/new").expect(1).mount(&env.http_mock).await;
    let config = env.webhook("/hooks/old").build();
    env.add_webhook(&config).await;

    let processor = env.processor(TestEnv::processor_config())?;
    processor.start().await?;
    processor.stop().await?;

    let moved = env.webhook("/hooks/new").id(config.id).build();
    env.add_webhook(&moved).await;

    processor.enqueue(DeliveryBuilder::new(config.id).build()).await?;
    processor.process_next().await?;

    assert_eq!(processor.refresh_configs().await?, 1);
    processor.enqueue(DeliveryBuilder::new(config.id).build()).await?;
    processor.process_next().await?;

    assert_eq!(http::received_on(&env.http_mock, "/hooks/old").await, 1);
    assert_eq!(http::received_on(&env.http_mock, "/hooks/new").await, 1);
    Ok(())
}

#[tokio::test]
async fn startup_aborts_when_configurations_cannot_load() -> Result<()> {
    let env = TestEnv::new().await;
    env.storage.inject_config_error("connection refused").await;
    let processor = env.processor(TestEnv::processor_config())?;

    let result = processor.start().await;

    assert!(matches!(result, Err(DeliveryError::StartupFailed { .. })));
    assert_eq!(processor.state(), ProcessorState::Stopped);

    env.storage.clear_injected_errors().await;
    processor.start().await?;
    assert_eq!(processor.state(), ProcessorState::Running);
    processor.stop().await?;
    Ok(())
}

/// Counts sends that are on the wire at the same time.
struct InFlightTracker {
    inner: ReqwestTransport,
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl HttpTransport for InFlightTracker {
    async fn post(
        &self,
        url: &str,
        body: Bytes,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let response = self.inner.post(url, body, headers, timeout).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

#[tokio::test]
async fn in_flight_deliveries_never_exceed_ceiling() -> Result<()> {
    const DELIVERIES: u64 = 12;
    const CEILING: usize = 2;

    let env = TestEnv::new().await;
    MockEndpoint::new("/hooks/slow")
        .respond(MockResponse::Delayed { status: 200, delay: Duration::from_millis(100) })
        .expect(DELIVERIES)
        .mount(&env.http_mock)
        .await;
    let config = env.webhook("/hooks/slow").retry_attempts(1_000).build();
    env.add_webhook(&config).await;

    let tracker = Arc::new(InFlightTracker {
        inner: ReqwestTransport::new(&ClientConfig::default())?,
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let processor = env.processor_with_transport(
        ProcessorConfig {
            max_concurrent_deliveries: CEILING,
            queue: QueueConfig {
                worker_count: 8,
                poll_interval: Duration::from_millis(5),
                ..QueueConfig::default()
            },
            ..TestEnv::processor_config()
        },
        tracker.clone(),
    );
    for _ in 0..DELIVERIES {
        processor.enqueue(DeliveryBuilder::new(config.id).build()).await?;
    }

    processor.start().await?;
    let deadline = tokio::time::Instant::now() + WAIT;
    let mut observed_peak = 0;
    loop {
        let stats = processor.stats().await?;
        observed_peak = observed_peak.max(stats.processing_count);
        if stats.successful_deliveries == DELIVERIES {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "deliveries did not finish: {stats:?}");

        // Refused deliveries back off on the test clock.
        env.clock.advance(Duration::from_secs(300));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    processor.stop().await?;

    let stats = processor.stats().await?;
    assert!(observed_peak <= CEILING, "processing_count reached {observed_peak}");
    assert_eq!(tracker.peak.load(Ordering::SeqCst), CEILING);
    assert!(stats.rate_limited_count > 0);
    assert_eq!(stats.processing_count, 0);
    Ok(())
}
