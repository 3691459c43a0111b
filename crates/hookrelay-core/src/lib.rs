//! Core domain models for the hookrelay webhook delivery engine.
//!
//! Provides strongly-typed identifiers, the delivery and webhook
//! configuration entities, dead-letter records, a clock abstraction for
//! deterministic testing, and the PostgreSQL repositories the delivery
//! engine persists through.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    DeadLetterEntry, DeadLetterId, DeadLetterStats, Delivery, DeliveryId, DeliveryStatus,
    NewDelivery, SubscriptionId, WebhookConfig, WebhookConfigRecord, WebhookFormat, WebhookId,
};
pub use time::{Clock, RealClock, TestClock};
