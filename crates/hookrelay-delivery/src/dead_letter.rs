//! Durable archive of deliveries removed from the retry path.

use std::sync::Arc;

use hookrelay_core::{Clock, DeadLetterEntry, DeadLetterId, DeadLetterStats, Delivery};
use tracing::{info, warn};

use crate::{
    error::{DeliveryError, Result},
    storage::DeadLetterStorage,
};

/// Reason recorded when a delivery exhausts its attempts.
pub const REASON_MAX_ATTEMPTS: &str = "max retry attempts exceeded";

/// Reason recorded when a delivery's webhook has no configuration.
pub const REASON_CONFIG_NOT_FOUND: &str = "configuration not found";

/// Dead-letter store over a storage backend.
#[derive(Clone)]
pub struct DeadLetterStore {
    storage: Arc<dyn DeadLetterStorage>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl DeadLetterStore {
    /// Creates a store.
    pub fn new(storage: Arc<dyn DeadLetterStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Archives a snapshot of `delivery`.
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be written.
    pub async fn add(
        &self,
        delivery: &Delivery,
        reason: &str,
        last_error: &str,
    ) -> Result<DeadLetterEntry> {
        let moved_at = self.clock.now_utc();
        let entry = DeadLetterEntry::new(delivery.clone(), reason, last_error, moved_at);
        self.storage.insert(entry.clone()).await?;

        warn!(
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            dead_letter_id = %entry.id,
            reason,
            attempts = delivery.attempts,
            "delivery moved to dead letter store"
        );
        Ok(entry)
    }

    /// Looks up a record.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        Ok(self.storage.find(id).await?)
    }

    /// Lists up to `limit` records, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.storage.list(limit).await?)
    }

    /// Removes a record and returns it, for replay.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterNotFound` if no record has this ID, or a storage
    /// error.
    pub async fn take(&self, id: DeadLetterId) -> Result<DeadLetterEntry> {
        let entry = self.storage.find(id).await?.ok_or(DeliveryError::DeadLetterNotFound { id })?;

        if !self.storage.delete(id).await? {
            return Err(DeliveryError::DeadLetterNotFound { id });
        }

        info!(dead_letter_id = %id, delivery_id = %entry.delivery_id, "dead letter entry taken");
        Ok(entry)
    }

    /// Aggregate counts.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn stats(&self) -> Result<DeadLetterStats> {
        Ok(self.storage.stats().await?)
    }
}
