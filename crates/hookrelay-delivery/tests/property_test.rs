//! Property-based tests for the delivery engine's invariants.
//!
//! Covers backoff bounds, attempt ceilings, breaker thresholds and the
//! tolerance of config normalization and validation to arbitrary input.

#![allow(clippy::unwrap_used)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use hookrelay_core::{
    models::DEFAULT_WEBHOOK_TIMEOUT_MS,
    Clock, Delivery, DeliveryStatus, SubscriptionId, WebhookConfig, WebhookConfigRecord, WebhookId,
};
use hookrelay_delivery::{
    config_cache::normalize, sender::MAX_WEBHOOK_TIMEOUT_MS, storage::memory::InMemoryStorage,
    validate_webhook_config, CircuitBreaker, CircuitConfig, CircuitState, DeliveryHandler,
    DeliveryQueue, HandlerOutcome, QueueConfig, RetryScheduler, TerminalFailure,
};
use hookrelay_testing::TestClock;
use proptest::prelude::*;
use serde_json::json;

struct AlwaysFails;

#[async_trait]
impl DeliveryHandler for AlwaysFails {
    async fn handle(&self, _delivery: &Delivery) -> HandlerOutcome {
        HandlerOutcome::Retryable("HTTP 500: Internal Server Error".into())
    }

    async fn on_terminal(&self, _delivery: &Delivery, _failure: TerminalFailure) {}
}

fn record_strategy() -> impl Strategy<Value = WebhookConfigRecord> {
    (
        ".{0,40}",
        proptest::option::of(".{0,12}"),
        proptest::option::of(".{0,60}"),
        proptest::option::of(any::<i64>()),
        proptest::option::of(any::<i32>()),
    )
        .prop_map(|(url, format, headers, timeout_ms, retry_attempts)| WebhookConfigRecord {
            id: WebhookId::new(),
            url,
            format,
            headers,
            timeout_ms,
            retry_attempts,
        })
}

proptest! {
    #[test]
    fn backoff_is_monotonic_and_bounded(
        base_ms in 1u64..10_000,
        max_ms in 1u64..1_000_000,
        attempt in 1u32..64,
    ) {
        let scheduler =
            RetryScheduler::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));

        let current = scheduler.next_delay(attempt);
        let next = scheduler.next_delay(attempt + 1);

        prop_assert!(current <= next);
        prop_assert!(next <= scheduler.max_delay);
        prop_assert!(scheduler.next_delay(1) == scheduler.base_delay.min(scheduler.max_delay));
    }

    #[test]
    fn breaker_opens_exactly_at_threshold(threshold in 1u32..20, failures in 0u32..40) {
        let mut breaker = CircuitBreaker::new(CircuitConfig {
            failure_threshold: threshold,
            ..CircuitConfig::default()
        });
        let now = Instant::now();

        for _ in 0..failures {
            breaker.record_failure(now);
        }

        let expected =
            if failures >= threshold { CircuitState::Open } else { CircuitState::Closed };
        prop_assert_eq!(breaker.state(), expected);
        prop_assert_eq!(breaker.can_execute(now), failures < threshold);
    }

    #[test]
    fn normalize_never_panics_and_yields_sane_values(record in record_strategy()) {
        let raw_timeout = record.timeout_ms;
        let config = normalize(record);

        match raw_timeout {
            Some(ms) if ms >= 0 => prop_assert_eq!(config.timeout_ms, u64::try_from(ms).unwrap()),
            _ => prop_assert_eq!(config.timeout_ms, DEFAULT_WEBHOOK_TIMEOUT_MS),
        }
    }

    #[test]
    fn validation_accepts_well_formed_configs(
        host in "[a-z]{1,12}\\.example\\.com",
        secure in any::<bool>(),
        timeout_ms in 1u64..=MAX_WEBHOOK_TIMEOUT_MS,
        retry_attempts in 1u32..100,
    ) {
        let scheme = if secure { "https" } else { "http" };
        let mut config = WebhookConfig::new(WebhookId::new(), format!("{scheme}://{host}/hook"));
        config.timeout_ms = timeout_ms;
        config.retry_attempts = retry_attempts;

        let report = validate_webhook_config(&config);
        prop_assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn validation_never_panics_on_arbitrary_urls(url in ".{0,80}", timeout_ms in any::<u64>()) {
        let mut config = WebhookConfig::new(WebhookId::new(), url);
        config.timeout_ms = timeout_ms;

        let report = validate_webhook_config(&config);
        prop_assert_eq!(report.is_valid, report.errors.is_empty());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn attempts_never_exceed_max_attempts(max_attempts in 1u32..8) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        let delivery = runtime.block_on(async {
            let storage = InMemoryStorage::new();
            let clock = TestClock::new();
            let queue = DeliveryQueue::new(
                Arc::new(storage.clone()),
                RetryScheduler::default(),
                Arc::new(clock.clone()),
                QueueConfig::default(),
            );
            let delivery = Delivery::new(
                SubscriptionId::new(),
                WebhookId::new(),
                json!({}),
                json!({"content": "ping"}),
                max_attempts,
                clock.now_utc(),
            );
            let id = queue.enqueue(delivery).await.unwrap();

            for _ in 0..(max_attempts * 2) {
                queue.process_next(&AlwaysFails).await.unwrap();
                clock.advance(Duration::from_secs(600));
            }
            queue.find(id).await.unwrap().unwrap()
        });

        prop_assert_eq!(delivery.status, DeliveryStatus::Failed);
        prop_assert_eq!(delivery.attempts, max_attempts);
    }
}
