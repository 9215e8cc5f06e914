use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::util::lock_unpoisoned;

pub const CACHE_HIT: &str = "cache.hit";
pub const CACHE_MISS: &str = "cache.miss";
pub const CACHE_REVALIDATE: &str = "cache.revalidate";
pub const RETRY_COUNT: &str = "retry.count";
pub const AUTH_REFRESHES: &str = "auth.refreshes";
pub const RATELIMITER_INFLIGHT: &str = "ratelimiter.inflight";

/// Receiver for engine counters and gauges. Calls are fire-and-forget.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, host: Option<&str>);

    fn gauge(&self, name: &'static str, host: &str, value: i64);
}

/// Handle the engine records through; a missing sink turns every call into a no-op.
#[derive(Clone, Default)]
pub struct Metrics {
    sink: Option<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Metrics")
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub(crate) fn increment(&self, name: &'static str, host: Option<&str>) {
        if let Some(sink) = &self.sink {
            sink.increment(name, host);
        }
    }

    pub(crate) fn gauge(&self, name: &'static str, host: &str, value: i64) {
        if let Some(sink) = &self.sink {
            sink.gauge(name, host, value);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    /// Latest gauge value per `(name, host)`.
    pub gauges: BTreeMap<(String, String), i64>,
    /// Highest value each gauge reached.
    pub gauge_peaks: BTreeMap<(String, String), i64>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge_peak(&self, name: &str, host: &str) -> i64 {
        self.gauge_peaks
            .get(&(name.to_string(), host.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// Process-local sink that keeps totals, for tests and the CLI summary.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    state: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        lock_unpoisoned(&self.state).clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &'static str, _host: Option<&str>) {
        let mut state = lock_unpoisoned(&self.state);
        *state.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    fn gauge(&self, name: &'static str, host: &str, value: i64) {
        let mut state = lock_unpoisoned(&self.state);
        let key = (name.to_string(), host.to_string());
        state.gauges.insert(key.clone(), value);
        let peak = state.gauge_peaks.entry(key).or_insert(value);
        if value > *peak {
            *peak = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_metrics_are_noops() {
        let metrics = Metrics::disabled();
        metrics.increment(CACHE_HIT, None);
        metrics.gauge(RATELIMITER_INFLIGHT, "a:443", 3);
    }

    #[test]
    fn in_memory_sink_counts_and_tracks_peaks() {
        let sink = Arc::new(InMemoryMetrics::new());
        let metrics = Metrics::new(sink.clone());
        metrics.increment(RETRY_COUNT, Some("a:443"));
        metrics.increment(RETRY_COUNT, Some("b:443"));
        metrics.gauge(RATELIMITER_INFLIGHT, "a:443", 2);
        metrics.gauge(RATELIMITER_INFLIGHT, "a:443", 1);

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.counter(RETRY_COUNT), 2);
        assert_eq!(snapshot.counter(CACHE_MISS), 0);
        assert_eq!(
            snapshot.gauges[&(RATELIMITER_INFLIGHT.to_string(), "a:443".to_string())],
            1
        );
        assert_eq!(snapshot.gauge_peak(RATELIMITER_INFLIGHT, "a:443"), 2);
    }
}
