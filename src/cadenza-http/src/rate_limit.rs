use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(300);

/// External listener for every Retry-After observation.
pub trait RateLimitSink: Send + Sync {
    fn on_retry_after(&self, host: &str, delay: Duration);
}

/// Remembers server back-off hints per host so later calls wait up front
/// instead of rediscovering the limit with another 429.
pub struct RateLimitObserver {
    cooldown_until: DashMap<String, Instant>,
    max_cooldown: Duration,
    sink: Option<Arc<dyn RateLimitSink>>,
}

impl std::fmt::Debug for RateLimitObserver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RateLimitObserver")
            .field("hosts", &self.cooldown_until.len())
            .field("max_cooldown", &self.max_cooldown)
            .finish()
    }
}

impl Default for RateLimitObserver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COOLDOWN)
    }
}

impl RateLimitObserver {
    pub fn new(max_cooldown: Duration) -> Self {
        Self {
            cooldown_until: DashMap::new(),
            max_cooldown,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RateLimitSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Last write wins; the delay is capped at the configured maximum cooldown.
    pub fn record_retry_after(&self, host: &str, delay: Duration, now: Instant) {
        let delay = delay.min(self.max_cooldown);
        let host = host.to_ascii_lowercase();
        if let Some(sink) = &self.sink {
            sink.on_retry_after(&host, delay);
        }
        if delay.is_zero() {
            self.cooldown_until.remove(&host);
            return;
        }
        tracing::debug!(host = %host, delay_ms = delay.as_millis() as u64, "recorded host cooldown");
        self.cooldown_until.insert(host, now + delay);
    }

    /// Time left before `host` should be contacted again.
    pub fn get_cooldown(&self, host: &str) -> Option<Duration> {
        let host = host.to_ascii_lowercase();
        let until = *self.cooldown_until.get(&host)?;
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.cooldown_until
                .remove_if(&host, |_, current| *current <= Instant::now());
            return None;
        }
        Some(remaining)
    }

    pub fn clear(&self, host: &str) {
        self.cooldown_until.remove(&host.to_ascii_lowercase());
    }
}
