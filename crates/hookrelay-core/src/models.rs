//! Core domain models and strongly-typed identifiers.
//!
//! Defines deliveries, webhook configurations, dead-letter records and the
//! newtype ID wrappers that keep them from being mixed up. Includes the
//! database decoding needed by the PostgreSQL repositories.

use std::{collections::{BTreeMap, HashMap}, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default per-request timeout for a webhook target, in milliseconds.
pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 30_000;

/// Default number of delivery attempts for a webhook target.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Identifier assigned to a delivery when it is enqueued. Never changes.
    DeliveryId
}

uuid_id! {
    /// Identifier of the subscription that produced a delivery.
    SubscriptionId
}

uuid_id! {
    /// Identifier of a webhook target configuration.
    ///
    /// Circuit breakers and cached configuration are keyed by this ID.
    WebhookId
}

uuid_id! {
    /// Identifier of a dead-letter record.
    DeadLetterId
}

/// Lifecycle status of a delivery.
///
/// ```text
/// pending ──claim──▶ processing ──ok──▶ completed
///    ▲                   │
///    └──retry/defer──────┤
///                        └──exhausted/permanent──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting to be claimed, possibly not before `next_retry_time`.
    Pending,

    /// Claimed by exactly one worker.
    Processing,

    /// Delivered successfully. Terminal.
    Completed,

    /// Exhausted or permanently failed. Terminal; a dead-letter record holds
    /// the context.
    Failed,
}

impl DeliveryStatus {
    /// Returns the storage representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid delivery status: {other}")),
        }
    }
}

/// Target platform a webhook payload was formatted for.
///
/// Unknown stored values normalize to `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookFormat {
    /// Plain JSON body.
    #[default]
    Generic,
    /// Discord webhook message.
    Discord,
    /// Slack incoming webhook.
    Slack,
    /// Telegram bot API message.
    Telegram,
}

impl WebhookFormat {
    /// Returns the storage representation of this format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Discord => "discord",
            Self::Slack => "slack",
            Self::Telegram => "telegram",
        }
    }

    /// Parses a stored format value, ignoring case and surrounding whitespace.
    ///
    /// Returns `None` for anything unrecognized so callers can decide how to
    /// report the fallback.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "generic" | "json" => Some(Self::Generic),
            "discord" => Some(Self::Discord),
            "slack" => Some(Self::Slack),
            "telegram" => Some(Self::Telegram),
            _ => None,
        }
    }
}

impl fmt::Display for WebhookFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery target descriptor resolved through the config cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook identifier.
    pub id: WebhookId,

    /// Destination URL.
    pub url: String,

    /// Target platform the payload was formatted for.
    #[serde(default)]
    pub format: WebhookFormat,

    /// Extra request headers, merged over the default content type.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Number of delivery attempts for new deliveries to this target.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_WEBHOOK_TIMEOUT_MS
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

impl WebhookConfig {
    /// Creates a generic-format config with default headers, timeout and
    /// retry attempts.
    pub fn new(id: WebhookId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            format: WebhookFormat::Generic,
            headers: HashMap::new(),
            timeout_ms: DEFAULT_WEBHOOK_TIMEOUT_MS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        }
    }

    /// Request timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Raw webhook configuration row as stored.
///
/// Headers are an unparsed text blob and the format is free text; the config
/// cache normalizes both when it turns a record into a `WebhookConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookConfigRecord {
    /// Webhook identifier.
    pub id: WebhookId,
    /// Destination URL.
    pub url: String,
    /// Stored format value.
    pub format: Option<String>,
    /// Stored headers as a JSON object blob.
    pub headers: Option<String>,
    /// Stored timeout in milliseconds.
    pub timeout_ms: Option<i64>,
    /// Stored retry attempts.
    pub retry_attempts: Option<i32>,
}

impl From<&WebhookConfig> for WebhookConfigRecord {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            id: config.id,
            url: config.url.clone(),
            format: Some(config.format.as_str().to_string()),
            headers: serde_json::to_string(&config.headers).ok(),
            timeout_ms: i64::try_from(config.timeout_ms).ok(),
            retry_attempts: i32::try_from(config.retry_attempts).ok(),
        }
    }
}

/// Input accepted from the upstream event pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDelivery {
    /// Originating subscription.
    pub subscription_id: SubscriptionId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Opaque upstream event.
    pub event: Value,
    /// Platform-formatted request body.
    pub payload: Value,
    /// Attempt ceiling. Resolved from the webhook's `retry_attempts` when
    /// absent.
    pub max_attempts: Option<u32>,
}

/// One queued notification to an external endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Immutable identifier assigned at enqueue time.
    pub id: DeliveryId,
    /// Originating subscription.
    pub subscription_id: SubscriptionId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Opaque upstream event.
    pub event: Value,
    /// Platform-formatted request body.
    pub payload: Value,
    /// Attempts made so far.
    pub attempts: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Current lifecycle status.
    pub status: DeliveryStatus,
    /// Earliest time the queue may pick this delivery up again.
    pub next_retry_time: Option<DateTime<Utc>>,
    /// Error text from the most recent failed or deferred attempt.
    pub last_error: Option<String>,
    /// When the delivery was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the delivery last changed.
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Creates a pending delivery with zero attempts.
    pub fn new(
        subscription_id: SubscriptionId,
        webhook_id: WebhookId,
        event: Value,
        payload: Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscription_id,
            webhook_id,
            event,
            payload,
            attempts: 0,
            max_attempts,
            status: DeliveryStatus::Pending,
            next_retry_time: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the delivery is pending and its retry time, if any,
    /// has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending
            && self.next_retry_time.map_or(true, |retry_at| retry_at <= now)
    }

    /// Returns true once no further attempts are allowed.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Builds a fresh pending delivery from this one, used when replaying a
    /// dead-lettered snapshot.
    pub fn replay(&self, now: DateTime<Utc>) -> Self {
        Self::new(
            self.subscription_id,
            self.webhook_id,
            self.event.clone(),
            self.payload.clone(),
            self.max_attempts,
            now,
        )
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Delivery {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let status: String = row.try_get("status")?;
        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;

        Ok(Self {
            id: row.try_get("id")?,
            subscription_id: row.try_get("subscription_id")?,
            webhook_id: row.try_get("webhook_id")?,
            event: row.try_get("event")?,
            payload: row.try_get("payload")?,
            attempts: u32::try_from(attempts)
                .map_err(|_| sqlx::Error::Decode("attempts cannot be negative".into()))?,
            max_attempts: u32::try_from(max_attempts)
                .map_err(|_| sqlx::Error::Decode("max_attempts cannot be negative".into()))?,
            status: status.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            next_retry_time: row.try_get("next_retry_time")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A delivery removed from the active retry path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Entry identifier used for manual replay.
    pub id: DeadLetterId,
    /// Identifier of the dead-lettered delivery.
    pub delivery_id: DeliveryId,
    /// Snapshot of the delivery at the time it was moved.
    pub delivery: Delivery,
    /// Short classification, e.g. "max retry attempts exceeded".
    pub reason: String,
    /// Detail of the last error seen.
    pub last_error: String,
    /// When the delivery was moved.
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Creates a record for `delivery`.
    pub fn new(
        delivery: Delivery,
        reason: impl Into<String>,
        last_error: impl Into<String>,
        moved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            delivery_id: delivery.id,
            delivery,
            reason: reason.into(),
            last_error: last_error.into(),
            moved_at,
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeadLetterEntry {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let snapshot: sqlx::types::Json<Delivery> = row.try_get("delivery")?;

        Ok(Self {
            id: row.try_get("id")?,
            delivery_id: row.try_get("delivery_id")?,
            delivery: snapshot.0,
            reason: row.try_get("reason")?,
            last_error: row.try_get("last_error")?,
            moved_at: row.try_get("moved_at")?,
        })
    }
}

/// Aggregate view of the dead-letter store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    /// Number of entries.
    pub total: u64,
    /// Entry counts per reason.
    pub by_reason: BTreeMap<String, u64>,
    /// Timestamp of the oldest entry.
    pub oldest_moved_at: Option<DateTime<Utc>>,
}
