//! Delivery queue with attempt and backoff bookkeeping.
//!
//! The queue owns every status transition of a delivery. Handlers report what
//! happened through `HandlerOutcome` and the queue decides what that means:
//!
//! | Outcome     | Attempts | Status                              |
//! |-------------|----------|-------------------------------------|
//! | `Delivered` | +1       | `completed`                         |
//! | `Retryable` | +1       | `pending` with backoff, or `failed` |
//! | `Permanent` | same     | `failed`                            |
//! | `Deferred`  | same     | `pending` at the given time         |
//!
//! A delivery that becomes `failed` is reported once through
//! `DeliveryHandler::on_terminal`. The queue never writes dead-letter
//! records itself.
//!
//! A claim is a lease. If the outcome cannot be recorded the claim is
//! released back to `pending`; if the worker dies instead, the row becomes
//! claimable again once `processing_lease` has passed.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookrelay_core::{Clock, Delivery, DeliveryId, DeliveryStatus};
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    dead_letter::REASON_MAX_ATTEMPTS,
    error::{DeliveryError, Result},
    retry::RetryScheduler,
    sender::DeliveryResult,
    storage::DeliveryStorage,
    worker_pool::WorkerPool,
};

/// What a handler did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The endpoint accepted the delivery.
    Delivered(DeliveryResult),
    /// The attempt failed and may be retried.
    Retryable(String),
    /// The delivery can never succeed.
    Permanent {
        /// Dead-letter classification.
        reason: String,
        /// Detail recorded as the last error.
        detail: String,
    },
    /// No attempt was made; pick the delivery up again at `retry_at`.
    Deferred {
        /// Why the attempt was skipped.
        reason: String,
        /// Earliest time to try again.
        retry_at: DateTime<Utc>,
    },
}

/// Escalation raised when a delivery becomes `failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalFailure {
    /// Dead-letter classification.
    pub reason: String,
    /// Last error seen.
    pub last_error: String,
}

/// Per-delivery processing logic.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Processes one claimed delivery.
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome;

    /// Called exactly once for each delivery that becomes `failed`, with
    /// the delivery as persisted.
    async fn on_terminal(&self, delivery: &Delivery, failure: TerminalFailure);
}

/// How long a delivery may stay claimed before another worker may take it
/// over. Longer than the largest webhook timeout.
pub const DEFAULT_PROCESSING_LEASE: Duration = Duration::from_secs(600);

/// Worker pool sizing.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
    /// Age after which a `processing` claim is presumed abandoned.
    pub processing_lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            poll_interval: Duration::from_millis(1000),
            processing_lease: DEFAULT_PROCESSING_LEASE,
        }
    }
}

/// State shared by the queue and its workers.
pub(crate) struct QueueCore {
    storage: Arc<dyn DeliveryStorage>,
    scheduler: RetryScheduler,
    clock: Arc<dyn Clock>,
    processing_lease: Duration,
}

impl QueueCore {
    pub(crate) fn new(
        storage: Arc<dyn DeliveryStorage>,
        scheduler: RetryScheduler,
        clock: Arc<dyn Clock>,
        processing_lease: Duration,
    ) -> Self {
        Self { storage, scheduler, clock, processing_lease }
    }

    /// Claims one due delivery and settles the handler's outcome. Returns
    /// false when nothing was due.
    pub(crate) async fn process_next(&self, handler: &dyn DeliveryHandler) -> Result<bool> {
        let now = self.clock.now_utc();
        let lease_expired_before = chrono::Duration::from_std(self.processing_lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let Some(delivery) = self.storage.claim_due(now, lease_expired_before).await? else {
            return Ok(false);
        };

        let span = info_span!(
            "process_delivery",
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            attempt = delivery.attempts.saturating_add(1),
        );

        async {
            let outcome = handler.handle(&delivery).await;
            if let Err(e) = self.settle(&delivery, outcome, handler).await {
                warn!(error = %e, "failed to record delivery outcome, releasing claim");
                self.release(&delivery).await;
                return Err(e);
            }
            Ok(())
        }
        .instrument(span)
        .await?;

        Ok(true)
    }

    async fn release(&self, delivery: &Delivery) {
        if let Err(e) = self.storage.release(delivery.id, self.clock.now_utc()).await {
            error!(
                error = %e,
                lease_secs = self.processing_lease.as_secs(),
                "failed to release claim, delivery is reclaimable once its lease expires"
            );
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        outcome: HandlerOutcome,
        handler: &dyn DeliveryHandler,
    ) -> Result<()> {
        let now = self.clock.now_utc();

        match outcome {
            HandlerOutcome::Delivered(result) => {
                let attempts = delivery.attempts.saturating_add(1);
                self.storage.mark_completed(delivery.id, attempts, now).await?;
                debug!(attempts, response_time_ms = result.response_time_ms, "delivery completed");
            },
            HandlerOutcome::Retryable(error) => {
                let attempts = delivery.attempts.saturating_add(1);
                if attempts < delivery.max_attempts {
                    let next_retry_time = self.scheduler.next_retry_at(attempts, now);
                    self.storage
                        .schedule_retry(delivery.id, attempts, next_retry_time, error.clone(), now)
                        .await?;
                    debug!(
                        attempts,
                        max_attempts = delivery.max_attempts,
                        next_retry_time = %next_retry_time,
                        error = %error,
                        "delivery scheduled for retry"
                    );
                } else {
                    self.fail(delivery, attempts, REASON_MAX_ATTEMPTS.to_string(), error, handler)
                        .await?;
                }
            },
            HandlerOutcome::Permanent { reason, detail } => {
                self.fail(delivery, delivery.attempts, reason, detail, handler).await?;
            },
            HandlerOutcome::Deferred { reason, retry_at } => {
                self.storage.defer(delivery.id, retry_at, reason.clone(), now).await?;
                debug!(retry_at = %retry_at, reason = %reason, "delivery deferred");
            },
        }

        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        attempts: u32,
        reason: String,
        last_error: String,
        handler: &dyn DeliveryHandler,
    ) -> Result<()> {
        let now = self.clock.now_utc();
        self.storage.mark_failed(delivery.id, attempts, last_error.clone(), now).await?;

        let mut failed = delivery.clone();
        failed.attempts = attempts;
        failed.status = DeliveryStatus::Failed;
        failed.next_retry_time = None;
        failed.last_error = Some(last_error.clone());
        failed.updated_at = now;

        info!(attempts, reason = %reason, "delivery failed permanently");
        handler.on_terminal(&failed, TerminalFailure { reason, last_error }).await;
        Ok(())
    }
}

/// Durable delivery queue processed by a worker pool.
pub struct DeliveryQueue {
    core: Arc<QueueCore>,
    config: QueueConfig,
    pool: Mutex<Option<WorkerPool>>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("config", &self.config)
            .field("scheduler", &self.core.scheduler)
            .finish_non_exhaustive()
    }
}

impl DeliveryQueue {
    /// Creates a queue over `storage`.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        scheduler: RetryScheduler,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            core: Arc::new(QueueCore::new(storage, scheduler, clock, config.processing_lease)),
            config,
            pool: Mutex::new(None),
        }
    }

    /// Backoff policy applied to retryable failures.
    pub fn scheduler(&self) -> &RetryScheduler {
        &self.core.scheduler
    }

    /// Persists a delivery for processing.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery cannot be stored.
    pub async fn enqueue(&self, delivery: Delivery) -> Result<DeliveryId> {
        let id = delivery.id;
        let webhook_id = delivery.webhook_id;
        self.core.storage.insert(delivery).await?;
        debug!(delivery_id = %id, webhook_id = %webhook_id, "delivery enqueued");
        Ok(id)
    }

    /// Starts the worker pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if already processing, or a configuration
    /// error for a zero-sized pool.
    pub async fn start_processing(&self, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        if self.config.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }

        let mut slot = self.pool.lock().await;
        if slot.is_some() {
            return Err(DeliveryError::invalid_state("idle", "processing"));
        }

        let mut pool = WorkerPool::new(self.config.worker_count, self.config.poll_interval);
        pool.spawn_workers(self.core.clone(), handler);
        *slot = Some(pool);
        Ok(())
    }

    /// Stops pulling new deliveries and waits for in-flight handlers to
    /// finish. A no-op when not processing.
    ///
    /// # Errors
    ///
    /// Returns `WorkerPanic` if a worker panicked.
    pub async fn stop_processing(&self) -> Result<()> {
        let pool = self.pool.lock().await.take();
        match pool {
            Some(pool) => pool.shutdown_graceful().await,
            None => Ok(()),
        }
    }

    /// Returns true while the worker pool is running.
    pub async fn is_processing(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    /// Number of pending deliveries, due or not.
    ///
    /// # Errors
    ///
    /// Returns error if storage cannot be read.
    pub async fn queue_size(&self) -> Result<u64> {
        Ok(self.core.storage.count_pending().await?)
    }

    /// Claims and processes one due delivery on the caller's task. Returns
    /// false when nothing was due.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn process_next(&self, handler: &dyn DeliveryHandler) -> Result<bool> {
        self.core.process_next(handler).await
    }

    /// Deletes completed deliveries older than `retention`.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn purge_completed(&self, retention: Duration) -> Result<u64> {
        let now = self.core.clock.now_utc();
        let before = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let purged = self.core.storage.purge_completed(before).await?;
        if purged > 0 {
            info!(purged, "purged completed deliveries");
        }
        Ok(purged)
    }

    /// Finds a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn find(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        Ok(self.core.storage.find(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
    };

    use hookrelay_core::{CoreError, SubscriptionId, TestClock, WebhookId};
    use serde_json::json;

    use super::*;
    use crate::storage::{memory::InMemoryStorage, StorageFuture};

    #[derive(Default)]
    struct ScriptedHandler {
        outcomes: StdMutex<VecDeque<HandlerOutcome>>,
        terminal: StdMutex<Vec<(Delivery, TerminalFailure)>>,
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn with(outcomes: Vec<HandlerOutcome>) -> Self {
            Self { outcomes: StdMutex::new(outcomes.into()), ..Self::default() }
        }

        fn terminal(&self) -> Vec<(Delivery, TerminalFailure)> {
            self.terminal.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryHandler for ScriptedHandler {
        async fn handle(&self, _delivery: &Delivery) -> HandlerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().pop_front().unwrap_or_else(delivered)
        }

        async fn on_terminal(&self, delivery: &Delivery, failure: TerminalFailure) {
            self.terminal.lock().unwrap().push((delivery.clone(), failure));
        }
    }

    fn delivered() -> HandlerOutcome {
        HandlerOutcome::Delivered(DeliveryResult {
            success: true,
            status_code: Some(200),
            response_time_ms: 5,
            error: None,
        })
    }

    /// Delegates to memory storage but fails a set number of completion and
    /// release writes.
    #[derive(Clone, Default)]
    struct FlakyStorage {
        inner: InMemoryStorage,
        failing_completions: Arc<AtomicUsize>,
        failing_releases: Arc<AtomicUsize>,
    }

    fn take_failure(remaining: &AtomicUsize) -> bool {
        remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }

    fn connection_reset<'a, T: 'a>() -> StorageFuture<'a, T> {
        Box::pin(async { Err(CoreError::Database("connection reset".into())) })
    }

    impl DeliveryStorage for FlakyStorage {
        fn insert(&self, delivery: Delivery) -> StorageFuture<'_, ()> {
            DeliveryStorage::insert(&self.inner, delivery)
        }

        fn claim_due(
            &self,
            now: DateTime<Utc>,
            lease_expired_before: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<Delivery>> {
            self.inner.claim_due(now, lease_expired_before)
        }

        fn release(&self, id: DeliveryId, now: DateTime<Utc>) -> StorageFuture<'_, ()> {
            if take_failure(&self.failing_releases) {
                return connection_reset();
            }
            self.inner.release(id, now)
        }

        fn mark_completed(
            &self,
            id: DeliveryId,
            attempts: u32,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            if take_failure(&self.failing_completions) {
                return connection_reset();
            }
            self.inner.mark_completed(id, attempts, now)
        }

        fn schedule_retry(
            &self,
            id: DeliveryId,
            attempts: u32,
            next_retry_time: DateTime<Utc>,
            last_error: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            self.inner.schedule_retry(id, attempts, next_retry_time, last_error, now)
        }

        fn defer(
            &self,
            id: DeliveryId,
            next_retry_time: DateTime<Utc>,
            reason: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            self.inner.defer(id, next_retry_time, reason, now)
        }

        fn mark_failed(
            &self,
            id: DeliveryId,
            attempts: u32,
            last_error: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            self.inner.mark_failed(id, attempts, last_error, now)
        }

        fn count_pending(&self) -> StorageFuture<'_, u64> {
            self.inner.count_pending()
        }

        fn find(&self, id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
            DeliveryStorage::find(&self.inner, id)
        }

        fn purge_completed(&self, before: DateTime<Utc>) -> StorageFuture<'_, u64> {
            self.inner.purge_completed(before)
        }
    }

    fn flaky_queue(storage: &FlakyStorage, clock: &TestClock) -> DeliveryQueue {
        DeliveryQueue::new(
            Arc::new(storage.clone()),
            RetryScheduler::default(),
            Arc::new(clock.clone()),
            QueueConfig::default(),
        )
    }

    struct Fixture {
        storage: InMemoryStorage,
        clock: TestClock,
        queue: DeliveryQueue,
    }

    fn fixture() -> Fixture {
        let storage = InMemoryStorage::new();
        let clock = TestClock::new();
        let queue = DeliveryQueue::new(
            Arc::new(storage.clone()),
            RetryScheduler::default(),
            Arc::new(clock.clone()),
            QueueConfig {
                worker_count: 2,
                poll_interval: Duration::from_millis(10),
                ..QueueConfig::default()
            },
        );
        Fixture { storage, clock, queue }
    }

    fn delivery(clock: &TestClock, max_attempts: u32) -> Delivery {
        Delivery::new(
            SubscriptionId::new(),
            WebhookId::new(),
            json!({"name": "Transfer"}),
            json!({"text": "hello"}),
            max_attempts,
            clock.now_utc(),
        )
    }

    #[tokio::test]
    async fn delivered_outcome_completes_delivery() {
        let f = fixture();
        let id = f.queue.enqueue(delivery(&f.clock, 3)).await.unwrap();
        let handler = ScriptedHandler::default();

        assert!(f.queue.process_next(&handler).await.unwrap());

        let stored = f.storage.delivery(id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(f.queue.queue_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_queue_reports_nothing_processed() {
        let f = fixture();
        assert!(!f.queue.process_next(&ScriptedHandler::default()).await.unwrap());
    }

    #[tokio::test]
    async fn retryable_outcome_schedules_backoff() {
        let f = fixture();
        let id = f.queue.enqueue(delivery(&f.clock, 3)).await.unwrap();
        let handler = ScriptedHandler::with(vec![HandlerOutcome::Retryable("HTTP 500".into())]);

        f.queue.process_next(&handler).await.unwrap();

        let stored = f.storage.delivery(id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 500"));
        assert_eq!(stored.next_retry_time, Some(f.clock.now_utc() + chrono::Duration::seconds(1)));

        assert!(!f.queue.process_next(&handler).await.unwrap(), "not yet due");
        f.clock.advance(Duration::from_secs(1));
        assert!(f.queue.process_next(&handler).await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_delivery_fails_and_escalates_once() {
        let f = fixture();
        let id = f.queue.enqueue(delivery(&f.clock, 2)).await.unwrap();
        let handler = ScriptedHandler::with(vec![
            HandlerOutcome::Retryable("HTTP 500: Internal Server Error".into()),
            HandlerOutcome::Retryable("HTTP 502: Bad Gateway".into()),
        ]);

        f.queue.process_next(&handler).await.unwrap();
        f.clock.advance(Duration::from_secs(1));
        f.queue.process_next(&handler).await.unwrap();
        f.clock.advance(Duration::from_secs(600));
        assert!(!f.queue.process_next(&handler).await.unwrap());

        let stored = f.storage.delivery(id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stored.attempts, 2);

        let terminal = handler.terminal();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].0.attempts, 2);
        assert_eq!(terminal[0].1.reason, REASON_MAX_ATTEMPTS);
        assert_eq!(terminal[0].1.last_error, "HTTP 502: Bad Gateway");
    }

    #[tokio::test]
    async fn permanent_outcome_fails_without_consuming_attempt() {
        let f = fixture();
        let id = f.queue.enqueue(delivery(&f.clock, 3)).await.unwrap();
        let handler = ScriptedHandler::with(vec![HandlerOutcome::Permanent {
            reason: "configuration not found".into(),
            detail: "no webhook config".into(),
        }]);

        f.queue.process_next(&handler).await.unwrap();

        let stored = f.storage.delivery(id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stored.attempts, 0);
        assert_eq!(handler.terminal()[0].1.reason, "configuration not found");
    }

    #[tokio::test]
    async fn deferred_outcome_keeps_attempts() {
        let f = fixture();
        let id = f.queue.enqueue(delivery(&f.clock, 3)).await.unwrap();
        let retry_at = f.clock.now_utc() + chrono::Duration::seconds(30);
        let handler = ScriptedHandler::with(vec![HandlerOutcome::Deferred {
            reason: "circuit open".into(),
            retry_at,
        }]);

        f.queue.process_next(&handler).await.unwrap();

        let stored = f.storage.delivery(id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.next_retry_time, Some(retry_at));
        assert!(handler.terminal().is_empty());
    }

    #[tokio::test]
    async fn workers_drain_queue_until_stopped() {
        let f = fixture();
        for _ in 0..5 {
            f.queue.enqueue(delivery(&f.clock, 3)).await.unwrap();
        }
        let handler = Arc::new(ScriptedHandler::default());

        f.queue.start_processing(handler.clone()).await.unwrap();
        assert!(f.queue.is_processing().await);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handler.calls.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.queue.stop_processing().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert!(!f.queue.is_processing().await);
        let completed = f
            .storage
            .deliveries()
            .await
            .into_iter()
            .filter(|d| d.status == DeliveryStatus::Completed)
            .count();
        assert_eq!(completed, 5);
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let f = fixture();
        let handler = Arc::new(ScriptedHandler::default());

        f.queue.start_processing(handler.clone()).await.unwrap();
        let second = f.queue.start_processing(handler).await;
        assert!(matches!(second, Err(DeliveryError::InvalidState { .. })));

        f.queue.stop_processing().await.unwrap();
        f.queue.stop_processing().await.unwrap();
    }

    #[tokio::test]
    async fn unrecorded_outcome_releases_claim_for_redelivery() {
        let storage = FlakyStorage::default();
        storage.failing_completions.store(1, Ordering::SeqCst);
        let clock = TestClock::new();
        let queue = flaky_queue(&storage, &clock);
        let id = queue.enqueue(delivery(&clock, 3)).await.unwrap();
        let handler = ScriptedHandler::default();

        assert!(queue.process_next(&handler).await.is_err());

        let released = storage.inner.delivery(id).await.unwrap();
        assert_eq!(released.status, DeliveryStatus::Pending);
        assert_eq!(released.attempts, 0);
        assert_eq!(queue.queue_size().await.unwrap(), 1);

        assert!(queue.process_next(&handler).await.unwrap());
        let stored = storage.inner.delivery(id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_claim_is_reclaimed_after_lease() {
        let storage = FlakyStorage::default();
        storage.failing_completions.store(1, Ordering::SeqCst);
        storage.failing_releases.store(1, Ordering::SeqCst);
        let clock = TestClock::new();
        let queue = flaky_queue(&storage, &clock);
        let id = queue.enqueue(delivery(&clock, 3)).await.unwrap();
        let handler = ScriptedHandler::default();

        assert!(queue.process_next(&handler).await.is_err());
        assert_eq!(storage.inner.delivery(id).await.unwrap().status, DeliveryStatus::Processing);

        clock.advance(DEFAULT_PROCESSING_LEASE - Duration::from_secs(1));
        assert!(!queue.process_next(&handler).await.unwrap(), "lease still held");

        clock.advance(Duration::from_secs(1));
        assert!(queue.process_next(&handler).await.unwrap());
        assert_eq!(storage.inner.delivery(id).await.unwrap().status, DeliveryStatus::Completed);
    }

    #[tokio::test]
    async fn purge_respects_retention() {
        let f = fixture();
        f.queue.enqueue(delivery(&f.clock, 3)).await.unwrap();
        f.queue.process_next(&ScriptedHandler::default()).await.unwrap();

        assert_eq!(f.queue.purge_completed(Duration::from_secs(3600)).await.unwrap(), 0);
        f.clock.advance(Duration::from_secs(3601));
        assert_eq!(f.queue.purge_completed(Duration::from_secs(3600)).await.unwrap(), 1);
    }
}
