//! Webhook delivery engine with bounded retries and per-endpoint isolation.
//!
//! This crate turns queued deliveries into HTTP notifications. Failed sends
//! are retried with exponential backoff, repeatedly failing endpoints are
//! isolated by circuit breakers, and deliveries that can never succeed end up
//! in a dead-letter store for manual replay.
//!
//! # Architecture
//!
//! The `QueueProcessor` owns every component as an explicit instance. A
//! worker pool inside the `DeliveryQueue` claims due deliveries one at a time
//! and hands each to the processor, which runs:
//!
//! 1. **Admission** - refuse when `max_concurrent_deliveries` are in flight
//! 2. **Config** - resolve the webhook through the TTL config cache
//! 3. **Validation** - refuse malformed configuration
//! 4. **Circuit Check** - defer while the webhook's breaker is open
//! 5. **Send** - post the payload and classify the outcome
//!
//! The processor answers with a `HandlerOutcome` and the queue applies the
//! attempt and backoff bookkeeping. Deliveries that become `failed` are
//! escalated back to the processor, which writes the dead-letter record.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookrelay_core::RealClock;
//! use hookrelay_delivery::{
//!     client::ReqwestTransport, metrics::MetricsRecorderSink, storage::memory::InMemoryStorage,
//!     DeliveryError, ProcessorConfig, ProcessorDeps, QueueProcessor,
//! };
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let deps = ProcessorDeps::with_storage(
//!     InMemoryStorage::new(),
//!     Arc::new(ReqwestTransport::with_defaults()?),
//!     Arc::new(MetricsRecorderSink),
//!     Arc::new(RealClock::new()),
//! );
//! let processor = QueueProcessor::new(ProcessorConfig::default(), deps);
//!
//! processor.start().await?;
//! // ...
//! processor.stop().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod config_cache;
pub mod dead_letter;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod sender;
pub mod storage;
mod worker_pool;

pub use circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, CircuitState};
pub use config_cache::WebhookConfigCache;
pub use dead_letter::DeadLetterStore;
pub use error::{DeliveryError, Result};
pub use processor::{ProcessorConfig, ProcessorDeps, ProcessorState, ProcessorStats, QueueProcessor};
pub use queue::{DeliveryHandler, DeliveryQueue, HandlerOutcome, QueueConfig, TerminalFailure};
pub use retry::RetryScheduler;
pub use sender::{validate_webhook_config, DeliveryResult, ValidationReport, WebhookSender};

/// Default number of queue workers.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default in-flight ceiling.
pub const DEFAULT_MAX_CONCURRENT_DELIVERIES: usize = 10;
