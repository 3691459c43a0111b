//! Storage abstraction layer for the delivery engine.
//!
//! The queue, config cache and dead-letter store talk to storage only through
//! these traits. Production uses `PostgresStorage` over the core
//! repositories; tests use `memory::InMemoryStorage`.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookrelay_core::{
    error::Result,
    storage::Storage,
    DeadLetterEntry, DeadLetterId, DeadLetterStats, Delivery, DeliveryId, WebhookConfigRecord,
    WebhookId,
};

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Row-level operations on queued deliveries.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Persists a new delivery.
    fn insert(&self, delivery: Delivery) -> StorageFuture<'_, ()>;

    /// Atomically claims one delivery and marks it `processing`. Claimable
    /// are pending deliveries whose retry time, if any, is not after `now`,
    /// and `processing` deliveries last touched at or before
    /// `lease_expired_before`, whose owner is presumed dead. No two callers
    /// may receive the same delivery.
    fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Delivery>>;

    /// Returns a `processing` delivery to `pending` untouched, giving up the
    /// claim. A no-op for any other status.
    fn release(&self, id: DeliveryId, now: DateTime<Utc>) -> StorageFuture<'_, ()>;

    /// Marks a delivery completed.
    fn mark_completed(
        &self,
        id: DeliveryId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Returns a delivery to `pending` with an incremented attempt count.
    fn schedule_retry(
        &self,
        id: DeliveryId,
        attempts: u32,
        next_retry_time: DateTime<Utc>,
        last_error: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Returns a delivery to `pending` without counting an attempt.
    fn defer(
        &self,
        id: DeliveryId,
        next_retry_time: DateTime<Utc>,
        reason: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Marks a delivery terminally failed.
    fn mark_failed(
        &self,
        id: DeliveryId,
        attempts: u32,
        last_error: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Counts deliveries in `pending`.
    fn count_pending(&self) -> StorageFuture<'_, u64>;

    /// Finds a delivery by ID.
    fn find(&self, id: DeliveryId) -> StorageFuture<'_, Option<Delivery>>;

    /// Deletes completed deliveries last updated before `before`.
    fn purge_completed(&self, before: DateTime<Utc>) -> StorageFuture<'_, u64>;
}

/// Read access to raw webhook configuration rows, plus an upsert used by the
/// administrative override.
pub trait WebhookConfigStorage: Send + Sync + 'static {
    /// Fetches one row.
    fn fetch(&self, id: WebhookId) -> StorageFuture<'_, Option<WebhookConfigRecord>>;

    /// Fetches every row.
    fn fetch_all(&self) -> StorageFuture<'_, Vec<WebhookConfigRecord>>;

    /// Inserts or replaces a row.
    fn upsert(&self, record: WebhookConfigRecord) -> StorageFuture<'_, ()>;
}

/// Durable dead-letter records.
pub trait DeadLetterStorage: Send + Sync + 'static {
    /// Persists a record.
    fn insert(&self, entry: DeadLetterEntry) -> StorageFuture<'_, ()>;

    /// Finds a record by ID.
    fn find(&self, id: DeadLetterId) -> StorageFuture<'_, Option<DeadLetterEntry>>;

    /// Lists the most recently moved records.
    fn list(&self, limit: usize) -> StorageFuture<'_, Vec<DeadLetterEntry>>;

    /// Deletes a record, returning whether it existed.
    fn delete(&self, id: DeadLetterId) -> StorageFuture<'_, bool>;

    /// Aggregate counts.
    fn stats(&self) -> StorageFuture<'_, DeadLetterStats>;
}

/// PostgreSQL implementation backed by the core repositories.
#[derive(Clone)]
pub struct PostgresStorage {
    storage: Arc<Storage>,
}

impl PostgresStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresStorage {
    fn insert(&self, delivery: Delivery) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.deliveries.insert(&delivery).await })
    }

    fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.storage.deliveries.claim_due(now, lease_expired_before).await })
    }

    fn release(&self, id: DeliveryId, now: DateTime<Utc>) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.deliveries.release(id, now).await })
    }

    fn mark_completed(
        &self,
        id: DeliveryId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.deliveries.mark_completed(id, attempts, now).await })
    }

    fn schedule_retry(
        &self,
        id: DeliveryId,
        attempts: u32,
        next_retry_time: DateTime<Utc>,
        last_error: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage
                .deliveries
                .schedule_retry(id, attempts, next_retry_time, &last_error, now)
                .await
        })
    }

    fn defer(
        &self,
        id: DeliveryId,
        next_retry_time: DateTime<Utc>,
        reason: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage.deliveries.defer(id, next_retry_time, &reason, now).await
        })
    }

    fn mark_failed(
        &self,
        id: DeliveryId,
        attempts: u32,
        last_error: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage.deliveries.mark_failed(id, attempts, &last_error, now).await
        })
    }

    fn count_pending(&self) -> StorageFuture<'_, u64> {
        Box::pin(async move { self.storage.deliveries.count_pending().await })
    }

    fn find(&self, id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.storage.deliveries.find(id).await })
    }

    fn purge_completed(&self, before: DateTime<Utc>) -> StorageFuture<'_, u64> {
        Box::pin(async move { self.storage.deliveries.purge_completed(before).await })
    }
}

impl WebhookConfigStorage for PostgresStorage {
    fn fetch(&self, id: WebhookId) -> StorageFuture<'_, Option<WebhookConfigRecord>> {
        Box::pin(async move { self.storage.webhook_configs.find(id).await })
    }

    fn fetch_all(&self) -> StorageFuture<'_, Vec<WebhookConfigRecord>> {
        Box::pin(async move { self.storage.webhook_configs.list_all().await })
    }

    fn upsert(&self, record: WebhookConfigRecord) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.webhook_configs.upsert(&record).await })
    }
}

impl DeadLetterStorage for PostgresStorage {
    fn insert(&self, entry: DeadLetterEntry) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.dead_letters.insert(&entry).await })
    }

    fn find(&self, id: DeadLetterId) -> StorageFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(async move { self.storage.dead_letters.find(id).await })
    }

    fn list(&self, limit: usize) -> StorageFuture<'_, Vec<DeadLetterEntry>> {
        Box::pin(async move { self.storage.dead_letters.list(limit).await })
    }

    fn delete(&self, id: DeadLetterId) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.dead_letters.delete(id).await })
    }

    fn stats(&self) -> StorageFuture<'_, DeadLetterStats> {
        Box::pin(async move { self.storage.dead_letters.stats().await })
    }
}

pub mod memory {
    //! In-memory storage for tests and embedded use.

    use std::{collections::HashMap, sync::Arc};

    use chrono::{DateTime, Utc};
    use hookrelay_core::{
        CoreError, DeadLetterEntry, DeadLetterId, DeadLetterStats, Delivery, DeliveryId,
        DeliveryStatus, WebhookConfigRecord, WebhookId,
    };
    use tokio::sync::Mutex;

    use super::{DeadLetterStorage, DeliveryStorage, StorageFuture, WebhookConfigStorage};

    #[derive(Debug, Default)]
    struct State {
        deliveries: HashMap<DeliveryId, Delivery>,
        configs: HashMap<WebhookId, WebhookConfigRecord>,
        dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
        config_error: Option<String>,
        dead_letter_error: Option<String>,
    }

    /// Storage held entirely in memory behind one async mutex.
    ///
    /// Clones share state. Errors can be injected to exercise failure paths.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryStorage {
        state: Arc<Mutex<State>>,
    }

    impl InMemoryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds or replaces a raw configuration row.
        pub async fn add_webhook_config(&self, record: WebhookConfigRecord) {
            self.state.lock().await.configs.insert(record.id, record);
        }

        /// Removes a configuration row.
        pub async fn remove_webhook_config(&self, id: WebhookId) {
            self.state.lock().await.configs.remove(&id);
        }

        /// Returns a stored delivery.
        pub async fn delivery(&self, id: DeliveryId) -> Option<Delivery> {
            self.state.lock().await.deliveries.get(&id).cloned()
        }

        /// Returns every stored delivery.
        pub async fn deliveries(&self) -> Vec<Delivery> {
            self.state.lock().await.deliveries.values().cloned().collect()
        }

        /// Returns every dead-letter record.
        pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
            self.state.lock().await.dead_letters.values().cloned().collect()
        }

        /// Makes configuration reads fail with `message`.
        pub async fn inject_config_error(&self, message: impl Into<String>) {
            self.state.lock().await.config_error = Some(message.into());
        }

        /// Makes dead-letter writes fail with `message`.
        pub async fn inject_dead_letter_error(&self, message: impl Into<String>) {
            self.state.lock().await.dead_letter_error = Some(message.into());
        }

        /// Clears every injected error.
        pub async fn clear_injected_errors(&self) {
            let mut state = self.state.lock().await;
            state.config_error = None;
            state.dead_letter_error = None;
        }
    }

    fn injected(error: &Option<String>) -> Result<(), CoreError> {
        match error {
            Some(message) => Err(CoreError::Database(message.clone())),
            None => Ok(()),
        }
    }

    fn update(
        deliveries: &mut HashMap<DeliveryId, Delivery>,
        id: DeliveryId,
        apply: impl FnOnce(&mut Delivery),
    ) -> Result<(), CoreError> {
        let delivery = deliveries
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))?;
        apply(delivery);
        Ok(())
    }

    impl DeliveryStorage for InMemoryStorage {
        fn insert(&self, delivery: Delivery) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                if state.deliveries.contains_key(&delivery.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "delivery {} already exists",
                        delivery.id
                    )));
                }
                state.deliveries.insert(delivery.id, delivery);
                Ok(())
            })
        }

        fn claim_due(
            &self,
            now: DateTime<Utc>,
            lease_expired_before: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<Delivery>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                let next = state
                    .deliveries
                    .values()
                    .filter(|d| {
                        d.is_due(now)
                            || (d.status == DeliveryStatus::Processing
                                && d.updated_at <= lease_expired_before)
                    })
                    .min_by_key(|d| (d.next_retry_time.unwrap_or(d.created_at), d.created_at))
                    .map(|d| d.id);

                let Some(id) = next else {
                    return Ok(None);
                };

                let claimed = state.deliveries.get_mut(&id).map(|delivery| {
                    delivery.status = DeliveryStatus::Processing;
                    delivery.updated_at = now;
                    delivery.clone()
                });
                Ok(claimed)
            })
        }

        fn release(&self, id: DeliveryId, now: DateTime<Utc>) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                update(&mut state.deliveries, id, |d| {
                    if d.status == DeliveryStatus::Processing {
                        d.status = DeliveryStatus::Pending;
                        d.updated_at = now;
                    }
                })
            })
        }

        fn mark_completed(
            &self,
            id: DeliveryId,
            attempts: u32,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                update(&mut state.deliveries, id, |d| {
                    d.status = DeliveryStatus::Completed;
                    d.attempts = attempts;
                    d.next_retry_time = None;
                    d.updated_at = now;
                })
            })
        }

        fn schedule_retry(
            &self,
            id: DeliveryId,
            attempts: u32,
            next_retry_time: DateTime<Utc>,
            last_error: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                update(&mut state.deliveries, id, |d| {
                    d.status = DeliveryStatus::Pending;
                    d.attempts = attempts;
                    d.next_retry_time = Some(next_retry_time);
                    d.last_error = Some(last_error);
                    d.updated_at = now;
                })
            })
        }

        fn defer(
            &self,
            id: DeliveryId,
            next_retry_time: DateTime<Utc>,
            reason: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                update(&mut state.deliveries, id, |d| {
                    d.status = DeliveryStatus::Pending;
                    d.next_retry_time = Some(next_retry_time);
                    d.last_error = Some(reason);
                    d.updated_at = now;
                })
            })
        }

        fn mark_failed(
            &self,
            id: DeliveryId,
            attempts: u32,
            last_error: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                update(&mut state.deliveries, id, |d| {
                    d.status = DeliveryStatus::Failed;
                    d.attempts = attempts;
                    d.next_retry_time = None;
                    d.last_error = Some(last_error);
                    d.updated_at = now;
                })
            })
        }

        fn count_pending(&self) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let state = self.state.lock().await;
                let pending = state
                    .deliveries
                    .values()
                    .filter(|d| d.status == DeliveryStatus::Pending)
                    .count();
                Ok(u64::try_from(pending).unwrap_or(u64::MAX))
            })
        }

        fn find(&self, id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
            Box::pin(async move { Ok(self.state.lock().await.deliveries.get(&id).cloned()) })
        }

        fn purge_completed(&self, before: DateTime<Utc>) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                let initial = state.deliveries.len();
                state.deliveries.retain(|_, d| {
                    !(d.status == DeliveryStatus::Completed && d.updated_at < before)
                });
                Ok(u64::try_from(initial - state.deliveries.len()).unwrap_or(0))
            })
        }
    }

    impl WebhookConfigStorage for InMemoryStorage {
        fn fetch(&self, id: WebhookId) -> StorageFuture<'_, Option<WebhookConfigRecord>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                injected(&state.config_error)?;
                Ok(state.configs.get(&id).cloned())
            })
        }

        fn fetch_all(&self) -> StorageFuture<'_, Vec<WebhookConfigRecord>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                injected(&state.config_error)?;
                Ok(state.configs.values().cloned().collect())
            })
        }

        fn upsert(&self, record: WebhookConfigRecord) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.state.lock().await.configs.insert(record.id, record);
                Ok(())
            })
        }
    }

    impl DeadLetterStorage for InMemoryStorage {
        fn insert(&self, entry: DeadLetterEntry) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                injected(&state.dead_letter_error)?;
                state.dead_letters.insert(entry.id, entry);
                Ok(())
            })
        }

        fn find(&self, id: DeadLetterId) -> StorageFuture<'_, Option<DeadLetterEntry>> {
            Box::pin(async move { Ok(self.state.lock().await.dead_letters.get(&id).cloned()) })
        }

        fn list(&self, limit: usize) -> StorageFuture<'_, Vec<DeadLetterEntry>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                let mut entries: Vec<_> = state.dead_letters.values().cloned().collect();
                entries.sort_by(|a, b| b.moved_at.cmp(&a.moved_at));
                entries.truncate(limit);
                Ok(entries)
            })
        }

        fn delete(&self, id: DeadLetterId) -> StorageFuture<'_, bool> {
            Box::pin(async move { Ok(self.state.lock().await.dead_letters.remove(&id).is_some()) })
        }

        fn stats(&self) -> StorageFuture<'_, DeadLetterStats> {
            Box::pin(async move {
                let state = self.state.lock().await;
                let mut stats = DeadLetterStats::default();
                for entry in state.dead_letters.values() {
                    stats.total += 1;
                    *stats.by_reason.entry(entry.reason.clone()).or_default() += 1;
                    stats.oldest_moved_at = Some(match stats.oldest_moved_at {
                        Some(current) if current <= entry.moved_at => current,
                        _ => entry.moved_at,
                    });
                }
                Ok(stats)
            })
        }
    }

}
