//! Time-based response cache with conditional revalidation.
//!
//! Entries are keyed by a logical endpoint name plus its sorted parameters.
//! An entry is never edited in place: a refresh or a revalidation inserts a
//! whole new [`CacheEntry`] under the same key, last writer wins.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadenza_core::{CacheConfig, EndpointCacheConfig};
use dashmap::DashMap;

use crate::metrics::{Metrics, CACHE_HIT, CACHE_MISS, CACHE_REVALIDATE};
use crate::response::HttpResponse;

/// Caching decision for one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    pub should_cache: bool,
    pub ttl: Duration,
    /// Whether expired entries may be revalidated with If-None-Match / If-Modified-Since.
    pub revalidate: bool,
}

impl CachePolicy {
    pub const fn disabled() -> Self {
        Self {
            should_cache: false,
            ttl: Duration::ZERO,
            revalidate: false,
        }
    }

    pub const fn ttl(ttl: Duration) -> Self {
        Self {
            should_cache: true,
            ttl,
            revalidate: true,
        }
    }
}

pub trait CachePolicyProvider: Send + Sync {
    fn get_policy(&self, endpoint: &str, params: &[(String, String)]) -> CachePolicy;
}

/// Caches nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCachePolicy;

impl CachePolicyProvider for NoCachePolicy {
    fn get_policy(&self, _endpoint: &str, _params: &[(String, String)]) -> CachePolicy {
        CachePolicy::disabled()
    }
}

/// Policy driven by the `[http.cache]` section of the configuration.
#[derive(Clone, Debug)]
pub struct ConfigCachePolicy {
    enabled: bool,
    default_ttl: Duration,
    endpoints: BTreeMap<String, EndpointCacheConfig>,
}

impl ConfigCachePolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            endpoints: config.endpoints.clone(),
        }
    }
}

impl CachePolicyProvider for ConfigCachePolicy {
    fn get_policy(&self, endpoint: &str, _params: &[(String, String)]) -> CachePolicy {
        if !self.enabled {
            return CachePolicy::disabled();
        }
        match self.endpoints.get(endpoint) {
            Some(settings) => CachePolicy {
                should_cache: settings.enabled && settings.ttl_secs > 0,
                ttl: Duration::from_secs(settings.ttl_secs),
                revalidate: settings.revalidate,
            },
            None if self.default_ttl.is_zero() => CachePolicy::disabled(),
            None => CachePolicy::ttl(self.default_ttl),
        }
    }
}

/// Revalidation tokens taken from a response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn from_response(response: &HttpResponse) -> Self {
        Self {
            etag: response.etag().map(str::to_string),
            last_modified: response.last_modified().map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Storage for revalidation tokens; may outlive the in-memory entries.
pub trait ConditionalRequestState: Send + Sync {
    fn try_get_validators(&self, key: &CacheKey) -> Option<Validators>;

    fn set_validators(&self, key: &CacheKey, validators: Validators);
}

#[derive(Debug, Default)]
pub struct InMemoryConditionalState {
    validators: DashMap<CacheKey, Validators>,
}

impl InMemoryConditionalState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConditionalRequestState for InMemoryConditionalState {
    fn try_get_validators(&self, key: &CacheKey) -> Option<Validators> {
        self.validators.get(key).map(|entry| entry.value().clone())
    }

    fn set_validators(&self, key: &CacheKey, validators: Validators) {
        if validators.is_empty() {
            self.validators.remove(key);
        } else {
            self.validators.insert(key.clone(), validators);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    endpoint: String,
    params: String,
}

impl CacheKey {
    pub fn new(endpoint: &str, params: &[(String, String)]) -> Self {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();
        let params = sorted
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        Self {
            endpoint: endpoint.to_string(),
            params,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.params.is_empty() {
            formatter.write_str(&self.endpoint)
        } else {
            write!(formatter, "{}?{}", self.endpoint, self.params)
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: HttpResponse,
    pub expires_at: Instant,
    pub validators: Validators,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Clone, Debug)]
pub enum CacheLookup {
    /// Served without touching the network.
    Fresh(HttpResponse),
    /// Expired, but the origin can be asked whether it changed.
    Stale {
        value: HttpResponse,
        validators: Validators,
    },
    Miss,
}

pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    policy: Arc<dyn CachePolicyProvider>,
    conditional: Arc<dyn ConditionalRequestState>,
    metrics: Metrics,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ResponseCache {
    pub fn new(
        policy: Arc<dyn CachePolicyProvider>,
        conditional: Arc<dyn ConditionalRequestState>,
        metrics: Metrics,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            conditional,
            metrics,
        }
    }

    pub fn policy_for(&self, endpoint: &str, params: &[(String, String)]) -> CachePolicy {
        self.policy.get_policy(endpoint, params)
    }

    pub fn should_cache(&self, endpoint: &str) -> bool {
        self.policy.get_policy(endpoint, &[]).should_cache
    }

    pub fn get_duration(&self, endpoint: &str) -> Duration {
        self.policy.get_policy(endpoint, &[]).ttl
    }

    pub fn try_get(&self, endpoint: &str, params: &[(String, String)]) -> CacheLookup {
        let key = CacheKey::new(endpoint, params);
        let Some(entry) = self.entries.get(&key).map(|entry| entry.value().clone()) else {
            self.metrics.increment(CACHE_MISS, None);
            tracing::debug!(key = %key, "cache miss");
            return CacheLookup::Miss;
        };

        if entry.is_fresh(Instant::now()) {
            self.metrics.increment(CACHE_HIT, None);
            tracing::debug!(key = %key, "cache hit");
            return CacheLookup::Fresh(entry.value);
        }

        let validators = if entry.validators.is_empty() {
            self.conditional.try_get_validators(&key).unwrap_or_default()
        } else {
            entry.validators.clone()
        };
        if validators.is_empty() || !self.policy.get_policy(endpoint, params).revalidate {
            self.entries
                .remove_if(&key, |_, current| !current.is_fresh(Instant::now()));
            self.metrics.increment(CACHE_MISS, None);
            tracing::debug!(key = %key, "cache entry expired");
            return CacheLookup::Miss;
        }

        tracing::debug!(key = %key, "cache entry stale, revalidating");
        CacheLookup::Stale {
            value: entry.value,
            validators,
        }
    }

    /// Stores `value` for `ttl`, capturing its ETag / Last-Modified.
    pub fn set(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        value: HttpResponse,
        ttl: Duration,
    ) {
        if ttl.is_zero() {
            return;
        }
        let key = CacheKey::new(endpoint, params);
        let validators = Validators::from_response(&value);
        self.conditional.set_validators(&key, validators.clone());
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                expires_at: Instant::now() + ttl,
                validators,
            },
        );
    }

    /// Extends an entry after a 304. Returns `false` when there is nothing to extend.
    pub fn revalidate(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> bool {
        let key = CacheKey::new(endpoint, params);
        let Some(current) = self.entries.get(&key).map(|entry| entry.value().clone()) else {
            return false;
        };
        let ttl = self.policy.get_policy(endpoint, params).ttl;
        let validators = Validators {
            etag: etag.map(str::to_string).or(current.validators.etag),
            last_modified: last_modified
                .map(str::to_string)
                .or(current.validators.last_modified),
        };
        self.conditional.set_validators(&key, validators.clone());
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value: current.value,
                expires_at: Instant::now() + ttl,
                validators,
            },
        );
        self.metrics.increment(CACHE_REVALIDATE, None);
        true
    }

    pub(crate) fn record_miss(&self) {
        self.metrics.increment(CACHE_MISS, None);
    }

    pub fn clear_endpoint(&self, endpoint: &str) {
        self.entries.retain(|key, _| key.endpoint() != endpoint);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drops expired entries that cannot be revalidated anyway.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.is_fresh(now) || !entry.validators.is_empty());
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
