use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::HttpError;
use crate::metrics::{Metrics, RATELIMITER_INFLIGHT};
use crate::profile::ResilienceProfile;

const GATE_ENTRY_IDLE_TTL: Duration = Duration::from_secs(300);
const GATE_MAX_ENTRIES: usize = 1024;

#[derive(Debug)]
struct GateEntry {
    semaphore: Arc<Semaphore>,
    limit: usize,
    last_used_at: Instant,
}

impl GateEntry {
    fn new(limit: usize, now: Instant) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            last_used_at: now,
        }
    }

    fn is_idle(&self) -> bool {
        self.semaphore.available_permits() == self.limit
    }
}

/// Bounds concurrent sends per host: first against the optional aggregate
/// limit shared by every profile, then against the calling profile's own limit.
#[derive(Debug, Default)]
pub struct HostConcurrencyGate {
    per_profile: DashMap<(String, String), GateEntry>,
    aggregate: DashMap<String, GateEntry>,
    in_flight: DashMap<String, Arc<AtomicI64>>,
    metrics: Metrics,
}

/// Proof of a held slot. Dropping it releases every semaphore it holds exactly once.
#[derive(Debug)]
pub struct HostPermit {
    host: String,
    _aggregate: Option<OwnedSemaphorePermit>,
    _profile: OwnedSemaphorePermit,
    in_flight: Arc<AtomicI64>,
    metrics: Metrics,
}

impl HostPermit {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for HostPermit {
    fn drop(&mut self) {
        let value = self.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        self.metrics.gauge(RATELIMITER_INFLIGHT, &self.host, value);
    }
}

impl HostConcurrencyGate {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
            ..Self::default()
        }
    }

    /// Waits for capacity on `host` under `profile`, or fails with
    /// [`HttpError::Cancelled`] when `cancel` fires first.
    pub async fn acquire(
        &self,
        host: &str,
        profile: &ResilienceProfile,
        cancel: &CancellationToken,
    ) -> Result<HostPermit, HttpError> {
        if cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }
        let host = host.to_ascii_lowercase();
        self.maybe_cleanup();

        let aggregate = match profile.aggregate_concurrency_per_host() {
            Some(limit) => {
                let semaphore = self.aggregate_semaphore(&host, limit);
                Some(acquire_slot(semaphore, cancel).await?)
            }
            None => None,
        };
        let semaphore = self.profile_semaphore(
            &host,
            profile.name(),
            profile.configured_max_concurrency_per_host(),
        );
        // an aggregate permit taken above is released if this wait is cancelled
        let permit = acquire_slot(semaphore, cancel).await?;

        let counter = self
            .in_flight
            .entry(host.clone())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone();
        let value = counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.gauge(RATELIMITER_INFLIGHT, &host, value);

        Ok(HostPermit {
            host,
            _aggregate: aggregate,
            _profile: permit,
            in_flight: counter,
            metrics: self.metrics.clone(),
        })
    }

    pub fn release(&self, permit: HostPermit) {
        drop(permit);
    }

    /// Sends currently holding a permit for `host`.
    pub fn in_flight(&self, host: &str) -> usize {
        self.in_flight
            .get(&host.to_ascii_lowercase())
            .map(|counter| counter.load(Ordering::Acquire).max(0) as usize)
            .unwrap_or(0)
    }

    /// Drops semaphores that have been idle past the TTL. Entries with an
    /// outstanding permit are always kept.
    pub fn cleanup_idle(&self) {
        let now = Instant::now();
        let stale = |entry: &GateEntry| {
            entry.is_idle() && now.duration_since(entry.last_used_at) > GATE_ENTRY_IDLE_TTL
        };
        self.per_profile.retain(|_, entry| !stale(entry));
        self.aggregate.retain(|_, entry| !stale(entry));
    }

    fn maybe_cleanup(&self) {
        if self.per_profile.len() > GATE_MAX_ENTRIES || self.aggregate.len() > GATE_MAX_ENTRIES {
            self.cleanup_idle();
        }
    }

    fn aggregate_semaphore(&self, host: &str, limit: usize) -> Arc<Semaphore> {
        let now = Instant::now();
        let mut entry = self
            .aggregate
            .entry(host.to_string())
            .or_insert_with(|| GateEntry::new(limit, now));
        entry.last_used_at = now;
        // first profile to touch a host sizes the shared limit
        if entry.limit != limit {
            tracing::debug!(
                host = %host,
                configured = entry.limit,
                requested = limit,
                "aggregate host limit already sized by another profile"
            );
        }
        entry.semaphore.clone()
    }

    fn profile_semaphore(&self, host: &str, profile: &str, limit: usize) -> Arc<Semaphore> {
        let now = Instant::now();
        let mut entry = self
            .per_profile
            .entry((host.to_string(), profile.to_string()))
            .or_insert_with(|| GateEntry::new(limit, now));
        if entry.limit != limit {
            // a redefined profile gets a fresh semaphore; old permits drain on their own
            *entry = GateEntry::new(limit, now);
        }
        entry.last_used_at = now;
        entry.semaphore.clone()
    }
}

async fn acquire_slot(
    semaphore: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, HttpError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HttpError::Cancelled),
        // gate semaphores are never closed
        permit = semaphore.acquire_owned() => permit.map_err(|_| HttpError::Cancelled),
    }
}
