//! Clock abstraction so retry schedules, circuit timeouts and backlog
//! warnings can be driven deterministically in tests.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
///
/// Production code uses `RealClock`. Tests inject `TestClock` and advance it
/// explicitly, which makes every time-based decision in the delivery engine
/// reproducible.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Returns the current system time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same underlying time, so a clone handed to the engine
/// observes every `advance` made through the original.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Monotonic time in nanoseconds since start
    monotonic_ns: Arc<AtomicU64>,
    /// System time as nanoseconds since UNIX_EPOCH
    system_ns: Arc<AtomicU64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_ns: Arc::new(AtomicU64::new(saturating_nanos(since_epoch))),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let duration_ns = saturating_nanos(duration);
        self.monotonic_ns.fetch_add(duration_ns, Ordering::AcqRel);
        self.system_ns.fetch_add(duration_ns, Ordering::AcqRel);
    }

    /// Returns how far the clock has been advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.system_ns.load(Ordering::Acquire))
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
