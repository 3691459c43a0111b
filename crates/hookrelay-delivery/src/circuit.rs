//! Per-webhook circuit breakers.
//!
//! Each webhook target gets its own breaker, created lazily on first use and
//! kept for the lifetime of the registry.
//!
//! # State Machine
//!
//! ```text
//!                     ┌──────────────────────────┐
//!                     │          CLOSED          │
//!                     │ ● every request allowed  │
//!                     │ ● failures counted       │
//!                     └──────────────────────────┘
//!                       │                      ▲
//!   failure_count hits  │                      │ trial succeeds
//!   failure_threshold   │                      │ (counters reset)
//!                       ▼                      │
//!   ┌──────────────────────────┐   now >= next_attempt_time   ┌──────────────────────┐
//!   │           OPEN           │ ───────────────────────────▶ │      HALF-OPEN       │
//!   │ ● requests refused       │                              │ ● exactly one trial  │
//!   │ ● next_attempt_time set  │ ◀─────────────────────────── │                      │
//!   └──────────────────────────┘        trial fails           └──────────────────────┘
//! ```
//!
//! A success outside half-open discards failures older than the monitoring
//! window, so old incidents never add up to a trip.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use hookrelay_core::{Clock, WebhookId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Circuit breaker configuration shared by every webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures that open a closed circuit.
    pub failure_threshold: u32,
    /// How long an open circuit refuses requests before allowing a trial.
    pub reset_timeout: Duration,
    /// Age after which recorded failures are discarded on the next success.
    pub monitoring_window: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
            monitoring_window: Duration::from_millis(300_000),
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Refusing requests until `next_attempt_time`.
    Open,
    /// Allowing a single trial request.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    /// Current state.
    pub state: CircuitState,
    /// Failures counted toward the threshold.
    pub failure_count: u32,
    /// Successes recorded since the last reset.
    pub success_count: u32,
    /// When the most recent failure was recorded.
    pub last_failure_time: Option<Instant>,
    /// When an open circuit will allow its next trial. Only set while open.
    pub next_attempt_time: Option<Instant>,
}

/// Outcome of asking a breaker for permission to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// The request may proceed.
    Allowed,
    /// The request must not be sent.
    Rejected {
        /// State that caused the refusal.
        state: CircuitState,
        /// Time until the breaker will consider a trial, when known.
        retry_after: Option<Duration>,
    },
}

impl CircuitDecision {
    /// Returns true if the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// State machine for a single protected endpoint.
///
/// Callers pass the current instant so the machine stays deterministic.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            trial_in_flight: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Snapshot of counters and timestamps.
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_time: self.last_failure_time,
            next_attempt_time: self.next_attempt_time,
        }
    }

    /// Returns true if a request may be sent now.
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open
    /// and grants this one call; further calls are refused until the trial
    /// is recorded.
    pub fn can_execute(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => match self.next_attempt_time {
                Some(next_attempt) if now >= next_attempt => {
                    self.state = CircuitState::HalfOpen;
                    self.next_attempt_time = None;
                    self.trial_in_flight = true;
                    true
                },
                _ => false,
            },
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            },
        }
    }

    /// Time remaining until an open breaker allows a trial.
    pub fn retry_after(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.next_attempt_time) {
            (CircuitState::Open, Some(next_attempt)) => {
                Some(next_attempt.saturating_duration_since(now))
            },
            _ => None,
        }
    }

    /// Records a successful request.
    pub fn record_success(&mut self, now: Instant) {
        if self.state == CircuitState::HalfOpen {
            self.reset();
            return;
        }

        self.success_count = self.success_count.saturating_add(1);

        let stale = self
            .last_failure_time
            .is_some_and(|at| now.saturating_duration_since(at) > self.config.monitoring_window);
        if stale {
            self.failure_count = 0;
            self.last_failure_time = None;
        }
    }

    /// Records a failed request.
    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);

        match self.state {
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.open(now);
            },
            CircuitState::Closed | CircuitState::Open => {},
        }
    }

    /// Opens the breaker regardless of counters.
    pub fn force_open(&mut self, now: Instant) {
        self.open(now);
    }

    /// Closes the breaker and clears every counter.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure_time = None;
        self.next_attempt_time = None;
        self.trial_in_flight = false;
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.next_attempt_time = Some(now + self.config.reset_timeout);
        self.trial_in_flight = false;
    }
}

/// Thread-safe registry of breakers keyed by webhook.
///
/// Every operation takes the registry lock, so concurrent completions for
/// the same webhook never lose a failure count.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<WebhookId, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, circuits: Mutex::new(HashMap::new()) }
    }

    /// Configuration applied to new breakers.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Asks the webhook's breaker for permission to send.
    pub async fn check(&self, webhook_id: WebhookId) -> CircuitDecision {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let breaker = self.breaker(&mut circuits, webhook_id);
        let before = breaker.state();

        let decision = if breaker.can_execute(now) {
            CircuitDecision::Allowed
        } else {
            CircuitDecision::Rejected {
                state: breaker.state(),
                retry_after: breaker.retry_after(now),
            }
        };

        log_transition(webhook_id, before, breaker);
        decision
    }

    /// Records a successful send.
    pub async fn record_success(&self, webhook_id: WebhookId) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let breaker = self.breaker(&mut circuits, webhook_id);
        let before = breaker.state();

        breaker.record_success(now);
        log_transition(webhook_id, before, breaker);
    }

    /// Records a failed send.
    pub async fn record_failure(&self, webhook_id: WebhookId) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let breaker = self.breaker(&mut circuits, webhook_id);
        let before = breaker.state();

        breaker.record_failure(now);
        log_transition(webhook_id, before, breaker);
    }

    /// Administrative override that opens the webhook's breaker.
    pub async fn force_open(&self, webhook_id: WebhookId) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let breaker = self.breaker(&mut circuits, webhook_id);
        let before = breaker.state();

        breaker.force_open(now);
        warn!(webhook_id = %webhook_id, from = %before, "circuit forced open");
    }

    /// Administrative override that closes the webhook's breaker.
    pub async fn reset(&self, webhook_id: WebhookId) {
        let mut circuits = self.circuits.lock().await;
        if let Some(breaker) = circuits.get_mut(&webhook_id) {
            let before = breaker.state();
            breaker.reset();
            info!(webhook_id = %webhook_id, from = %before, "circuit reset");
        }
    }

    /// Snapshot of one breaker, if it has been used.
    pub async fn stats(&self, webhook_id: WebhookId) -> Option<CircuitStats> {
        self.circuits.lock().await.get(&webhook_id).map(CircuitBreaker::stats)
    }

    /// Snapshot of every breaker.
    pub async fn all_stats(&self) -> HashMap<WebhookId, CircuitStats> {
        self.circuits.lock().await.iter().map(|(id, breaker)| (*id, breaker.stats())).collect()
    }

    fn breaker<'a>(
        &self,
        circuits: &'a mut HashMap<WebhookId, CircuitBreaker>,
        webhook_id: WebhookId,
    ) -> &'a mut CircuitBreaker {
        circuits.entry(webhook_id).or_insert_with(|| CircuitBreaker::new(self.config.clone()))
    }
}

fn log_transition(webhook_id: WebhookId, before: CircuitState, breaker: &CircuitBreaker) {
    let after = breaker.state();
    if before == after {
        return;
    }

    match after {
        CircuitState::Open => warn!(
            webhook_id = %webhook_id,
            from = %before,
            failure_count = breaker.failure_count,
            "circuit opened"
        ),
        CircuitState::HalfOpen => {
            info!(webhook_id = %webhook_id, "circuit half-open, allowing trial request");
        },
        CircuitState::Closed => info!(webhook_id = %webhook_id, from = %before, "circuit closed"),
    }
}
