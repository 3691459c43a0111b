//! TTL cache of webhook configurations.
//!
//! Reads go through the cache first and fall back to a single-row storage
//! fetch on miss. Stored rows are normalized on the way in: a header blob
//! that does not parse becomes an empty map and an unknown format becomes
//! the generic format, both with a warning. Normalization never fails.
//!
//! Expiry is tracked by moka on wall-clock time. The injected `Clock` only
//! stamps `last_full_load`, so advancing a test clock does not expire
//! entries.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use hookrelay_core::{
    models::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_WEBHOOK_TIMEOUT_MS},
    Clock, WebhookConfig, WebhookConfigRecord, WebhookFormat, WebhookId,
};
use moka::future::Cache;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{error::Result, storage::WebhookConfigStorage};

/// Default time-to-live for cached entries.
pub const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(300);

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct ConfigCacheConfig {
    /// How long an entry stays valid after insertion, in wall-clock time.
    pub ttl: Duration,
    /// Upper bound on cached entries.
    pub max_capacity: u64,
}

impl Default for ConfigCacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_CONFIG_TTL, max_capacity: 10_000 }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries currently cached.
    pub entries: u64,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that went to storage.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 before the first lookup.
    pub hit_rate: f64,
    /// When `load_all` last completed.
    pub last_full_load: Option<DateTime<Utc>>,
}

/// Webhook configuration cache owned by the queue processor.
pub struct WebhookConfigCache {
    storage: Arc<dyn WebhookConfigStorage>,
    clock: Arc<dyn Clock>,
    cache: Cache<WebhookId, WebhookConfig>,
    hits: AtomicU64,
    misses: AtomicU64,
    last_full_load: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for WebhookConfigCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfigCache")
            .field("entries", &self.cache.entry_count())
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WebhookConfigCache {
    /// Creates an empty cache over `storage`.
    pub fn new(
        storage: Arc<dyn WebhookConfigStorage>,
        clock: Arc<dyn Clock>,
        config: ConfigCacheConfig,
    ) -> Self {
        let cache =
            Cache::builder().time_to_live(config.ttl).max_capacity(config.max_capacity).build();

        Self {
            storage,
            clock,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            last_full_load: Mutex::new(None),
        }
    }

    /// Resolves a webhook's configuration, fetching exactly that row from
    /// storage on a miss.
    ///
    /// # Errors
    ///
    /// Returns error if the storage lookup fails.
    pub async fn get(&self, webhook_id: WebhookId) -> Result<Option<WebhookConfig>> {
        if let Some(config) = self.cache.get(&webhook_id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(config));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(webhook_id = %webhook_id, "webhook config cache miss");

        let Some(record) = self.storage.fetch(webhook_id).await? else {
            return Ok(None);
        };

        let config = normalize(record);
        self.cache.insert(webhook_id, config.clone()).await;
        Ok(Some(config))
    }

    /// Clears the cache and bulk-loads every stored configuration.
    ///
    /// # Errors
    ///
    /// Returns error if storage cannot be read. The cache is left empty.
    pub async fn load_all(&self) -> Result<usize> {
        self.cache.invalidate_all();
        let records = self.storage.fetch_all().await?;
        let loaded = self.populate(records).await;

        info!(count = loaded, "loaded webhook configurations");
        Ok(loaded)
    }

    /// Reloads every configuration. Unlike `load_all`, storage is read
    /// before the cache is cleared, so a failed refresh keeps the current
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns error if storage cannot be read.
    pub async fn refresh(&self) -> Result<usize> {
        let records = match self.storage.fetch_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "webhook config refresh failed, keeping cached entries");
                return Err(e.into());
            },
        };

        self.cache.invalidate_all();
        let loaded = self.populate(records).await;
        debug!(count = loaded, "refreshed webhook configurations");
        Ok(loaded)
    }

    /// Drops one entry so the next `get` goes to storage.
    pub async fn invalidate(&self, webhook_id: WebhookId) {
        self.cache.invalidate(&webhook_id).await;
    }

    /// Places a configuration in the cache, overriding what storage holds
    /// until the entry expires.
    pub async fn insert(&self, config: WebhookConfig) {
        self.cache.insert(config.id, config).await;
    }

    /// Current statistics.
    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 };

        CacheStats {
            entries: self.cache.entry_count(),
            hits,
            misses,
            hit_rate,
            last_full_load: *self.last_full_load.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    async fn populate(&self, records: Vec<WebhookConfigRecord>) -> usize {
        let count = records.len();
        for record in records {
            let config = normalize(record);
            self.cache.insert(config.id, config).await;
        }

        *self.last_full_load.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(self.clock.now_utc());
        count
    }
}

/// Turns a stored row into a usable configuration.
///
/// Missing or negative timeout and retry values fall back to the defaults.
/// Zero is kept so validation can report it.
pub fn normalize(record: WebhookConfigRecord) -> WebhookConfig {
    let headers = match record.headers.as_deref().map(str::trim) {
        None | Some("") => HashMap::new(),
        Some(blob) => serde_json::from_str::<HashMap<String, String>>(blob).unwrap_or_else(|e| {
            warn!(
                webhook_id = %record.id,
                error = %e,
                "unparseable webhook headers, using empty headers"
            );
            HashMap::new()
        }),
    };

    let format = match record.format.as_deref() {
        None => WebhookFormat::Generic,
        Some(value) => WebhookFormat::parse(value).unwrap_or_else(|| {
            warn!(
                webhook_id = %record.id,
                format = value,
                "unknown webhook format, using generic"
            );
            WebhookFormat::Generic
        }),
    };

    let timeout_ms = record
        .timeout_ms
        .and_then(|ms| u64::try_from(ms).ok())
        .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_MS);
    let retry_attempts = record
        .retry_attempts
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(DEFAULT_RETRY_ATTEMPTS);

    WebhookConfig { id: record.id, url: record.url, format, headers, timeout_ms, retry_attempts }
}
