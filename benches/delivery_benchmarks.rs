//! Benchmarks for the delivery engine's hot paths.
//!
//! Tracks the per-delivery overhead the processor adds on top of the HTTP
//! call itself: backoff computation, breaker checks, config validation and
//! normalization, and one full claim-handle-settle cycle against in-memory
//! storage.

use std::{
    hint::black_box,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use hookrelay_core::{
    Clock, Delivery, SubscriptionId, TestClock, WebhookConfig, WebhookConfigRecord, WebhookId,
};
use hookrelay_delivery::{
    config_cache::normalize, storage::memory::InMemoryStorage, validate_webhook_config,
    CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, DeliveryHandler, DeliveryQueue,
    DeliveryResult, HandlerOutcome, QueueConfig, RetryScheduler, TerminalFailure,
};
use serde_json::json;
use tokio::runtime::Runtime;

struct AcceptAll;

#[async_trait]
impl DeliveryHandler for AcceptAll {
    async fn handle(&self, _delivery: &Delivery) -> HandlerOutcome {
        HandlerOutcome::Delivered(DeliveryResult {
            success: true,
            status_code: Some(200),
            response_time_ms: 0,
            error: None,
        })
    }

    async fn on_terminal(&self, _delivery: &Delivery, _failure: TerminalFailure) {}
}

fn bench_retry_scheduler(c: &mut Criterion) {
    let scheduler = RetryScheduler::default();
    let now = chrono::Utc::now();

    let mut group = c.benchmark_group("retry_scheduler");
    for attempt in [1_u32, 5, 20, 64] {
        group.bench_with_input(BenchmarkId::new("next_retry_at", attempt), &attempt, |b, &a| {
            b.iter(|| scheduler.next_retry_at(black_box(a), black_box(now)));
        });
    }
    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("closed_check_and_success", |b| {
        let mut breaker = CircuitBreaker::new(CircuitConfig::default());
        let now = Instant::now();
        b.iter(|| {
            let allowed = breaker.can_execute(black_box(now));
            breaker.record_success(now);
            allowed
        });
    });

    group.bench_function("open_rejection", |b| {
        let mut breaker = CircuitBreaker::new(CircuitConfig::default());
        let now = Instant::now();
        breaker.force_open(now);
        b.iter(|| breaker.can_execute(black_box(now)));
    });

    let rt = Runtime::new().unwrap();
    let registry =
        CircuitBreakerRegistry::new(CircuitConfig::default(), Arc::new(TestClock::new()));
    let webhooks: Vec<WebhookId> = (0..1_000).map(|_| WebhookId::new()).collect();
    group.bench_function("registry_check_1k_webhooks", |b| {
        let mut next = 0;
        b.iter(|| {
            let webhook = webhooks[next % webhooks.len()];
            next += 1;
            rt.block_on(registry.check(webhook))
        });
    });

    group.finish();
}

fn bench_config_handling(c: &mut Criterion) {
    let mut group = c.benchmark_group("webhook_config");

    let config = WebhookConfig::new(WebhookId::new(), "https://discord.com/api/webhooks/1/abc");
    group.bench_function("validate", |b| b.iter(|| validate_webhook_config(black_box(&config))));

    let record = WebhookConfigRecord {
        id: WebhookId::new(),
        url: "https://hooks.slack.com/services/T000/B000/XXXX".to_string(),
        format: Some("slack".to_string()),
        headers: Some(r#"{"X-Signature":"sha256=abc","X-Team":"eng"}"#.to_string()),
        timeout_ms: Some(10_000),
        retry_attempts: Some(5),
    };
    group.bench_function("normalize", |b| {
        b.iter_batched(|| record.clone(), normalize, BatchSize::SmallInput);
    });

    group.finish();
}

fn bench_queue_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue");
    group.measurement_time(Duration::from_secs(10));
    group.bench_function("enqueue_and_process_one", |b| {
        let clock = TestClock::new();
        let queue = DeliveryQueue::new(
            Arc::new(InMemoryStorage::new()),
            RetryScheduler::default(),
            Arc::new(clock.clone()),
            QueueConfig::default(),
        );
        b.iter(|| {
            rt.block_on(async {
                let delivery = Delivery::new(
                    SubscriptionId::new(),
                    WebhookId::new(),
                    json!({"name": "Transfer"}),
                    json!({"content": "Transfer of 5 ETH"}),
                    3,
                    clock.now_utc(),
                );
                queue.enqueue(delivery).await.unwrap();
                queue.process_next(&AcceptAll).await.unwrap()
            })
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_retry_scheduler,
    bench_circuit_breaker,
    bench_config_handling,
    bench_queue_cycle
);
criterion_main!(benches);
