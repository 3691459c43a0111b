//! Write-only metrics sink.
//!
//! The engine only ever increments counters and records gauges; exposition
//! format is the installed recorder's concern.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

/// Deliveries refused by admission control.
pub const RATE_LIMITED_TOTAL: &str = "queue_processor_rate_limited_total";
/// Backlog warnings emitted.
pub const BACKLOG_WARNINGS_TOTAL: &str = "queue_processor_backlog_warnings_total";
/// Deliveries that reached their endpoint successfully.
pub const DELIVERIES_SUCCEEDED_TOTAL: &str = "queue_processor_deliveries_succeeded_total";
/// Send attempts that failed.
pub const DELIVERIES_FAILED_TOTAL: &str = "queue_processor_deliveries_failed_total";
/// Deliveries moved to the dead-letter store, labelled by reason.
pub const DEAD_LETTERED_TOTAL: &str = "queue_processor_dead_lettered_total";
/// In-flight deliveries.
pub const ACTIVE_DELIVERIES: &str = "queue_processor_active_deliveries";
/// Pending deliveries in the queue.
pub const QUEUE_SIZE: &str = "queue_processor_queue_size";
/// In-flight deliveries as a percentage of the concurrency ceiling.
pub const UTILIZATION_PERCENT: &str = "queue_processor_utilization_percent";
/// HTTP requests made by the sender, labelled by outcome.
pub const SENDER_REQUESTS_TOTAL: &str = "webhook_sender_requests_total";
/// Response time of the most recent request per webhook.
pub const SENDER_RESPONSE_TIME_MS: &str = "webhook_sender_response_time_ms";

/// Destination for counters and gauges.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Adds one to a counter.
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Sets a gauge to `value`.
    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Forwards to the process-wide `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorderSink;

impl MetricsSink for MetricsRecorderSink {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        metrics::counter!(name.to_owned(), to_labels(labels)).increment(1);
    }

    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        metrics::gauge!(name.to_owned(), to_labels(labels)).set(value);
    }
}

fn to_labels(labels: &[(&str, &str)]) -> Vec<metrics::Label> {
    labels
        .iter()
        .map(|(key, value)| metrics::Label::new((*key).to_owned(), (*value).to_owned()))
        .collect()
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}

    fn record_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

type SeriesKey = (String, BTreeMap<String, String>);

#[derive(Debug, Default)]
struct Recorded {
    counters: HashMap<SeriesKey, u64>,
    gauges: HashMap<SeriesKey, f64>,
}

/// Keeps every value in memory so tests can assert on it.
///
/// Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    recorded: Arc<Mutex<Recorded>>,
}

impl InMemoryMetrics {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of a counter across all label sets.
    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.iter().filter(|((n, _), _)| n == name).map(|(_, v)| *v).sum()
    }

    /// Value of a counter for one exact label set.
    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.lock().counters.get(&series_key(name, labels)).copied().unwrap_or(0)
    }

    /// Last value recorded for a gauge without labels.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauge_with(name, &[])
    }

    /// Last value recorded for a gauge with one exact label set.
    pub fn gauge_with(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.lock().gauges.get(&series_key(name, labels)).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self.lock().counters.entry(series_key(name, labels)).or_default() += 1;
    }

    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.lock().gauges.insert(series_key(name, labels), value);
    }
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
    let labels = labels.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
    (name.to_owned(), labels)
}
