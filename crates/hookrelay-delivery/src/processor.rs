//! Queue processor: the orchestrator that owns every delivery component.
//!
//! ```text
//!   stopped ──start()──▶ starting ──configs loaded──▶ running
//!      ▲                    │                            │
//!      └──load failed───────┘                         stop()
//!      │                                                 ▼
//!      └──────────────workers drained───────────── stopping
//! ```
//!
//! Per delivery the processor runs admission control, config resolution,
//! validation, the circuit check and the send, in that order, and reports a
//! `HandlerOutcome` back to the queue. Escalated failures are written to the
//! dead-letter store here and nowhere else.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use hookrelay_core::{
    Clock, DeadLetterEntry, DeadLetterId, DeadLetterStats, Delivery, DeliveryId, NewDelivery,
    WebhookConfig, WebhookConfigRecord, WebhookId,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    circuit::{CircuitBreakerRegistry, CircuitConfig, CircuitDecision, CircuitStats},
    client::HttpTransport,
    config_cache::{CacheStats, ConfigCacheConfig, WebhookConfigCache},
    dead_letter::{DeadLetterStore, REASON_CONFIG_NOT_FOUND},
    error::{DeliveryError, Result},
    metrics::{
        MetricsSink, ACTIVE_DELIVERIES, BACKLOG_WARNINGS_TOTAL, DEAD_LETTERED_TOTAL,
        DELIVERIES_FAILED_TOTAL, DELIVERIES_SUCCEEDED_TOTAL, QUEUE_SIZE, RATE_LIMITED_TOTAL,
        UTILIZATION_PERCENT,
    },
    queue::{DeliveryHandler, DeliveryQueue, HandlerOutcome, QueueConfig, TerminalFailure},
    retry::RetryScheduler,
    sender::{validate_webhook_config, WebhookSender},
    storage::{DeadLetterStorage, DeliveryStorage, WebhookConfigStorage},
};

/// Processor tuning plus the configs of the components it owns.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// In-flight ceiling enforced by admission control.
    pub max_concurrent_deliveries: usize,
    /// Queue size above which backlog warnings are emitted.
    pub queue_backlog_threshold: u64,
    /// Minimum spacing between backlog warnings.
    pub backlog_warning_interval: Duration,
    /// How often the backlog monitor runs.
    pub backlog_check_interval: Duration,
    /// Attempt ceiling when neither the delivery nor its webhook sets one.
    pub default_max_attempts: u32,
    /// How long completed deliveries are kept.
    pub completed_retention: Duration,
    /// Worker pool sizing.
    pub queue: QueueConfig,
    /// Backoff policy.
    pub retry: RetryScheduler,
    /// Circuit breaker thresholds.
    pub circuit: CircuitConfig,
    /// Config cache tuning.
    pub cache: ConfigCacheConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: crate::DEFAULT_MAX_CONCURRENT_DELIVERIES,
            queue_backlog_threshold: 100,
            backlog_warning_interval: Duration::from_millis(60_000),
            backlog_check_interval: Duration::from_millis(10_000),
            default_max_attempts: hookrelay_core::models::DEFAULT_RETRY_ATTEMPTS,
            completed_retention: Duration::from_secs(86_400),
            queue: QueueConfig::default(),
            retry: RetryScheduler::default(),
            circuit: CircuitConfig::default(),
            cache: ConfigCacheConfig::default(),
        }
    }
}

/// Collaborators the processor is wired to.
#[derive(Clone)]
pub struct ProcessorDeps {
    /// Delivery rows.
    pub deliveries: Arc<dyn DeliveryStorage>,
    /// Webhook configuration rows.
    pub webhook_configs: Arc<dyn WebhookConfigStorage>,
    /// Dead-letter records.
    pub dead_letters: Arc<dyn DeadLetterStorage>,
    /// Outbound HTTP.
    pub transport: Arc<dyn HttpTransport>,
    /// Counter and gauge sink.
    pub metrics: Arc<dyn MetricsSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl ProcessorDeps {
    /// Uses one backend for all three storage roles.
    pub fn with_storage<S>(
        storage: S,
        transport: Arc<dyn HttpTransport>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        S: DeliveryStorage + WebhookConfigStorage + DeadLetterStorage + Clone,
    {
        Self {
            deliveries: Arc::new(storage.clone()),
            webhook_configs: Arc::new(storage.clone()),
            dead_letters: Arc::new(storage),
            transport,
            metrics,
            clock,
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    /// Not processing.
    Stopped,
    /// Loading configuration.
    Starting,
    /// Workers and monitor running.
    Running,
    /// Draining in-flight deliveries.
    Stopping,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Snapshot of processor counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    /// True while in `running`.
    pub is_running: bool,
    /// Admitted handler invocations that have finished.
    pub total_processed: u64,
    /// Sends the endpoint accepted.
    pub successful_deliveries: u64,
    /// Sends that failed.
    pub failed_deliveries: u64,
    /// Pending deliveries.
    pub current_queue_size: u64,
    /// Deliveries in flight.
    pub processing_count: usize,
    /// In-flight ceiling.
    pub max_concurrent_deliveries: usize,
    /// Admissions refused at the ceiling.
    pub rate_limited_count: u64,
    /// Backlog warnings emitted.
    pub queue_backlog_warnings: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_processed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    backlog_warnings: AtomicU64,
}

/// Everything the per-delivery handler and the backlog monitor share.
struct Shared {
    config: ProcessorConfig,
    config_cache: WebhookConfigCache,
    config_storage: Arc<dyn WebhookConfigStorage>,
    circuits: CircuitBreakerRegistry,
    sender: WebhookSender,
    dead_letters: DeadLetterStore,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<HashSet<DeliveryId>>,
    counters: Counters,
    last_backlog_warning: Mutex<Option<Instant>>,
}

/// Releases an admission slot when the handler finishes, whatever the
/// outcome.
struct InFlightSlot<'a> {
    shared: &'a Shared,
    id: DeliveryId,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        let active = {
            let mut in_flight =
                self.shared.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight.remove(&self.id);
            in_flight.len()
        };
        self.shared.counters.total_processed.fetch_add(1, Ordering::Relaxed);
        self.shared.publish_active(active);
    }
}

impl Shared {
    fn admit(&self, id: DeliveryId) -> Option<InFlightSlot<'_>> {
        let active = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.len() >= self.config.max_concurrent_deliveries {
                return None;
            }
            in_flight.insert(id);
            in_flight.len()
        };
        self.publish_active(active);
        Some(InFlightSlot { shared: self, id })
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_active(&self, active: usize) {
        let max = self.config.max_concurrent_deliveries;
        let utilization = if max == 0 { 0.0 } else { active as f64 * 100.0 / max as f64 };
        self.metrics.record_gauge(ACTIVE_DELIVERIES, active as f64, &[]);
        self.metrics.record_gauge(UTILIZATION_PERCENT, utilization, &[]);
    }

    async fn deliver(&self, delivery: &Delivery) -> HandlerOutcome {
        let webhook_id = delivery.webhook_id;

        let config = match self.config_cache.get(webhook_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!(webhook_id = %webhook_id, "no configuration for webhook");
                return HandlerOutcome::Permanent {
                    reason: REASON_CONFIG_NOT_FOUND.to_string(),
                    detail: format!("no configuration found for webhook {webhook_id}"),
                };
            },
            Err(e) => return HandlerOutcome::Retryable(format!("configuration lookup failed: {e}")),
        };

        let report = validate_webhook_config(&config);
        if !report.is_valid {
            let first = report.errors.into_iter().next().unwrap_or_default();
            warn!(webhook_id = %webhook_id, error = %first, "webhook configuration invalid");
            return HandlerOutcome::Retryable(format!("invalid webhook configuration: {first}"));
        }

        if let CircuitDecision::Rejected { state, retry_after } =
            self.circuits.check(webhook_id).await
        {
            let wait = retry_after.unwrap_or(self.config.retry.base_delay);
            let now = self.clock.now_utc();
            let retry_at = chrono::Duration::from_std(wait)
                .ok()
                .and_then(|wait| now.checked_add_signed(wait))
                .unwrap_or(now);
            debug!(webhook_id = %webhook_id, state = %state, "circuit refused delivery");
            let reason = format!("circuit breaker {state}");
            return HandlerOutcome::Deferred { reason, retry_at };
        }

        let result = self.sender.send_webhook(delivery, &config).await;
        if result.success {
            self.circuits.record_success(webhook_id).await;
            self.counters.successful.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment_counter(DELIVERIES_SUCCEEDED_TOTAL, &[]);
            HandlerOutcome::Delivered(result)
        } else {
            self.circuits.record_failure(webhook_id).await;
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment_counter(DELIVERIES_FAILED_TOTAL, &[]);
            HandlerOutcome::Retryable(result.error.unwrap_or_else(|| "Unknown error".to_string()))
        }
    }
}

#[async_trait]
impl DeliveryHandler for Shared {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let Some(_slot) = self.admit(delivery.id) else {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment_counter(RATE_LIMITED_TOTAL, &[]);
            debug!(delivery_id = %delivery.id, "delivery refused by admission control");
            return HandlerOutcome::Retryable(format!(
                "rate limit exceeded: {} deliveries in flight",
                self.config.max_concurrent_deliveries
            ));
        };

        self.deliver(delivery).await
    }

    async fn on_terminal(&self, delivery: &Delivery, failure: TerminalFailure) {
        match self.dead_letters.add(delivery, &failure.reason, &failure.last_error).await {
            Ok(_) => {
                self.metrics
                    .increment_counter(DEAD_LETTERED_TOTAL, &[("reason", failure.reason.as_str())]);
            },
            Err(e) => error!(
                delivery_id = %delivery.id,
                reason = %failure.reason,
                error = %e,
                "failed to write dead letter entry"
            ),
        }
    }
}

async fn check_backlog(queue: &DeliveryQueue, shared: &Shared) {
    shared.publish_active(shared.in_flight_count());

    let size = match queue.queue_size().await {
        Ok(size) => size,
        Err(e) => {
            warn!(error = %e, "backlog check failed");
            return;
        },
    };

    #[allow(clippy::cast_precision_loss)]
    shared.metrics.record_gauge(QUEUE_SIZE, size as f64, &[]);

    if size <= shared.config.queue_backlog_threshold {
        return;
    }

    let now = shared.clock.now();
    let should_warn = {
        let mut last = shared.last_backlog_warning.lock().unwrap_or_else(PoisonError::into_inner);
        let due = last.map_or(true, |at| {
            now.saturating_duration_since(at) >= shared.config.backlog_warning_interval
        });
        if due {
            *last = Some(now);
        }
        due
    };

    if should_warn {
        shared.counters.backlog_warnings.fetch_add(1, Ordering::Relaxed);
        shared.metrics.increment_counter(BACKLOG_WARNINGS_TOTAL, &[]);
        warn!(
            queue_size = size,
            threshold = shared.config.queue_backlog_threshold,
            in_flight = shared.in_flight_count(),
            "delivery queue backlog above threshold"
        );
    }
}

async fn run_monitor(queue: Arc<DeliveryQueue>, shared: Arc<Shared>, token: CancellationToken) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(shared.config.backlog_check_interval) => {}
        }

        check_backlog(&queue, &shared).await;

        if let Err(e) = queue.purge_completed(shared.config.completed_retention).await {
            warn!(error = %e, "failed to purge completed deliveries");
        }
    }
}

struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Orchestrates the delivery queue, config cache, circuit breakers, sender
/// and dead-letter store.
pub struct QueueProcessor {
    shared: Arc<Shared>,
    queue: Arc<DeliveryQueue>,
    state: RwLock<ProcessorState>,
    monitor: tokio::sync::Mutex<Option<Monitor>>,
}

impl fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl QueueProcessor {
    /// Wires a stopped processor.
    pub fn new(config: ProcessorConfig, deps: ProcessorDeps) -> Self {
        let queue = DeliveryQueue::new(
            deps.deliveries,
            config.retry,
            deps.clock.clone(),
            config.queue.clone(),
        );
        let config_cache = WebhookConfigCache::new(
            deps.webhook_configs.clone(),
            deps.clock.clone(),
            config.cache.clone(),
        );
        let circuits = CircuitBreakerRegistry::new(config.circuit.clone(), deps.clock.clone());
        let sender = WebhookSender::new(deps.transport, deps.metrics.clone());
        let dead_letters = DeadLetterStore::new(deps.dead_letters, deps.clock.clone());

        let shared = Shared {
            config,
            config_cache,
            config_storage: deps.webhook_configs,
            circuits,
            sender,
            dead_letters,
            metrics: deps.metrics,
            clock: deps.clock,
            in_flight: Mutex::new(HashSet::new()),
            counters: Counters::default(),
            last_backlog_warning: Mutex::new(None),
        };

        Self {
            shared: Arc::new(shared),
            queue: Arc::new(queue),
            state: RwLock::new(ProcessorState::Stopped),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessorState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ProcessorState) {
        let previous = std::mem::replace(
            &mut *self.state.write().unwrap_or_else(PoisonError::into_inner),
            state,
        );
        info!(from = %previous, to = %state, "queue processor state changed");
    }

    fn transition(&self, expected: ProcessorState, next: ProcessorState) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != expected {
            return Err(DeliveryError::invalid_state(expected, *state));
        }
        *state = next;
        drop(state);

        info!(from = %expected, to = %next, "queue processor state changed");
        Ok(())
    }

    /// Loads every webhook configuration, then starts the workers and the
    /// backlog monitor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless stopped, or `StartupFailed` if
    /// configurations cannot be loaded. The processor is left stopped on
    /// failure.
    pub async fn start(&self) -> Result<()> {
        self.transition(ProcessorState::Stopped, ProcessorState::Starting)?;

        if let Err(e) = self.shared.config_cache.load_all().await {
            error!(error = %e, "failed to load webhook configurations");
            self.set_state(ProcessorState::Stopped);
            return Err(DeliveryError::startup(format!(
                "failed to load webhook configurations: {e}"
            )));
        }

        if let Err(e) = self.queue.start_processing(self.shared.clone()).await {
            self.set_state(ProcessorState::Stopped);
            return Err(e);
        }

        let token = CancellationToken::new();
        let handle =
            tokio::spawn(run_monitor(self.queue.clone(), self.shared.clone(), token.clone()));
        *self.monitor.lock().await = Some(Monitor { token, handle });

        self.set_state(ProcessorState::Running);
        Ok(())
    }

    /// Stops new pulls and waits for in-flight deliveries to finish. A no-op
    /// when already stopped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while starting or stopping, or `WorkerPanic`
    /// if a worker panicked. The processor ends stopped either way.
    pub async fn stop(&self) -> Result<()> {
        if self.state() == ProcessorState::Stopped {
            return Ok(());
        }
        self.transition(ProcessorState::Running, ProcessorState::Stopping)?;

        let drained = self.queue.stop_processing().await;

        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.token.cancel();
            if let Err(e) = monitor.handle.await {
                warn!(error = %e, "backlog monitor task failed");
            }
        }

        self.set_state(ProcessorState::Stopped);
        drained
    }

    /// Processes one due delivery on the caller's task.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn process_next(&self) -> Result<bool> {
        self.queue.process_next(self.shared.as_ref()).await
    }

    /// Runs the per-delivery pipeline without touching the queue.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> HandlerOutcome {
        self.shared.handle(delivery).await
    }

    /// Runs one backlog check immediately.
    pub async fn check_backlog(&self) {
        check_backlog(&self.queue, &self.shared).await;
    }

    /// Accepts a delivery from the upstream pipeline. Every delivery gets
    /// at least one attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery cannot be stored.
    pub async fn enqueue(&self, new: NewDelivery) -> Result<DeliveryId> {
        let max_attempts = match new.max_attempts {
            Some(max_attempts) => max_attempts,
            None => self.resolve_max_attempts(new.webhook_id).await,
        };
        if max_attempts == 0 {
            debug!(webhook_id = %new.webhook_id, "raising max attempts of 0 to 1");
        }
        let max_attempts = max_attempts.max(1);

        let delivery = Delivery::new(
            new.subscription_id,
            new.webhook_id,
            new.event,
            new.payload,
            max_attempts,
            self.shared.clock.now_utc(),
        );
        self.queue.enqueue(delivery).await
    }

    async fn resolve_max_attempts(&self, webhook_id: WebhookId) -> u32 {
        match self.shared.config_cache.get(webhook_id).await {
            Ok(Some(config)) if config.retry_attempts > 0 => config.retry_attempts,
            Ok(_) => self.shared.config.default_max_attempts,
            Err(e) => {
                warn!(webhook_id = %webhook_id, error = %e, "using default max attempts");
                self.shared.config.default_max_attempts
            },
        }
    }

    /// Re-enqueues a dead-lettered delivery as a fresh delivery and removes
    /// the record.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterNotFound` if no record has this ID, or a storage
    /// error.
    pub async fn retry_dead_letter(&self, id: DeadLetterId) -> Result<DeliveryId> {
        let entry = self
            .shared
            .dead_letters
            .get(id)
            .await?
            .ok_or(DeliveryError::DeadLetterNotFound { id })?;

        let delivery = entry.delivery.replay(self.shared.clock.now_utc());
        let delivery_id = self.queue.enqueue(delivery).await?;
        self.shared.dead_letters.take(id).await?;

        info!(
            dead_letter_id = %id,
            original_delivery_id = %entry.delivery_id,
            delivery_id = %delivery_id,
            "dead letter replayed"
        );
        Ok(delivery_id)
    }

    /// Dead-letter counts.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn dead_letter_stats(&self) -> Result<DeadLetterStats> {
        self.shared.dead_letters.stats().await
    }

    /// Most recent dead-letter records.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        self.shared.dead_letters.list(limit).await
    }

    /// Resolves a webhook's configuration through the cache.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails on a cache miss.
    pub async fn webhook_config(&self, webhook_id: WebhookId) -> Result<Option<WebhookConfig>> {
        self.shared.config_cache.get(webhook_id).await
    }

    /// Persists a configuration and makes it visible immediately.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn set_webhook_config(&self, config: WebhookConfig) -> Result<()> {
        self.shared.config_storage.upsert(WebhookConfigRecord::from(&config)).await?;
        info!(webhook_id = %config.id, url = %config.url, "webhook configuration updated");
        self.shared.config_cache.insert(config).await;
        Ok(())
    }

    /// Reloads every configuration, keeping cached entries on failure.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn refresh_configs(&self) -> Result<usize> {
        self.shared.config_cache.refresh().await
    }

    /// Config cache statistics.
    pub async fn config_cache_stats(&self) -> CacheStats {
        self.shared.config_cache.stats().await
    }

    /// Breaker statistics for a webhook, if it has been used.
    pub async fn circuit_stats(&self, webhook_id: WebhookId) -> Option<CircuitStats> {
        self.shared.circuits.stats(webhook_id).await
    }

    /// Opens a webhook's breaker.
    pub async fn force_circuit_open(&self, webhook_id: WebhookId) {
        self.shared.circuits.force_open(webhook_id).await;
    }

    /// Closes a webhook's breaker and clears its counters.
    pub async fn reset_circuit(&self, webhook_id: WebhookId) {
        self.shared.circuits.reset(webhook_id).await;
    }

    /// Counter snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the queue size cannot be read.
    pub async fn stats(&self) -> Result<ProcessorStats> {
        let current_queue_size = self.queue.queue_size().await?;
        let counters = &self.shared.counters;

        Ok(ProcessorStats {
            is_running: self.state() == ProcessorState::Running,
            total_processed: counters.total_processed.load(Ordering::Relaxed),
            successful_deliveries: counters.successful.load(Ordering::Relaxed),
            failed_deliveries: counters.failed.load(Ordering::Relaxed),
            current_queue_size,
            processing_count: self.shared.in_flight_count(),
            max_concurrent_deliveries: self.shared.config.max_concurrent_deliveries,
            rate_limited_count: counters.rate_limited.load(Ordering::Relaxed),
            queue_backlog_warnings: counters.backlog_warnings.load(Ordering::Relaxed),
        })
    }

    /// Finds a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn delivery(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        self.queue.find(id).await
    }
}
