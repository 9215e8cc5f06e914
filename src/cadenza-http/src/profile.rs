use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cadenza_core::{HttpConfig, ProfileConfig};

use crate::error::HttpError;

pub const SEARCH: &str = "search";
pub const DETAILS: &str = "details";
pub const CATALOG: &str = "catalog";
pub const DOWNLOAD: &str = "download";

/// Named retry/concurrency policy, selected per call site.
#[derive(Clone, Debug, PartialEq)]
pub struct ResilienceProfile {
    name: String,
    max_retries: u32,
    retry_budget: Option<Duration>,
    max_concurrency_per_host: usize,
    max_total_concurrency_per_host: i64,
    per_request_timeout: Option<Duration>,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
}

impl ResilienceProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retries: 3,
            retry_budget: Some(Duration::from_secs(30)),
            max_concurrency_per_host: 4,
            max_total_concurrency_per_host: 0,
            per_request_timeout: Some(Duration::from_secs(15)),
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            jitter_ratio: 0.2,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// `None` leaves retrying bounded by `max_retries` alone.
    pub fn retry_budget(mut self, retry_budget: Option<Duration>) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn max_concurrency_per_host(mut self, limit: usize) -> Self {
        self.max_concurrency_per_host = limit.max(1);
        self
    }

    /// Aggregate cap shared by every profile hitting the same host; `<= 0` disables it.
    pub fn max_total_concurrency_per_host(mut self, limit: i64) -> Self {
        self.max_total_concurrency_per_host = limit;
        self
    }

    pub fn per_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.per_request_timeout = timeout;
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configured_max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn configured_retry_budget(&self) -> Option<Duration> {
        self.retry_budget
    }

    pub fn configured_max_concurrency_per_host(&self) -> usize {
        self.max_concurrency_per_host
    }

    /// The aggregate per-host cap when one is configured.
    pub fn aggregate_concurrency_per_host(&self) -> Option<usize> {
        usize::try_from(self.max_total_concurrency_per_host)
            .ok()
            .filter(|limit| *limit > 0)
    }

    pub fn configured_per_request_timeout(&self) -> Option<Duration> {
        self.per_request_timeout
    }

    pub fn configured_base_backoff(&self) -> Duration {
        self.base_backoff
    }

    pub fn configured_max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn configured_jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    fn apply(mut self, overrides: &ProfileConfig) -> Self {
        if let Some(max_retries) = overrides.max_retries {
            self = self.max_retries(max_retries);
        }
        if let Some(budget_ms) = overrides.retry_budget_ms {
            self = self.retry_budget(Some(Duration::from_millis(budget_ms)));
        }
        if let Some(limit) = overrides.max_concurrency_per_host {
            self = self.max_concurrency_per_host(limit);
        }
        if let Some(limit) = overrides.max_total_concurrency_per_host {
            self = self.max_total_concurrency_per_host(limit);
        }
        if let Some(timeout_ms) = overrides.per_request_timeout_ms {
            self = self.per_request_timeout(Some(Duration::from_millis(timeout_ms)));
        }
        if let Some(base_ms) = overrides.base_backoff_ms {
            self = self.base_backoff(Duration::from_millis(base_ms));
        }
        if let Some(max_ms) = overrides.max_backoff_ms {
            self = self.max_backoff(Duration::from_millis(max_ms));
        }
        if let Some(jitter) = overrides.jitter_ratio {
            self = self.jitter_ratio(jitter);
        }
        self
    }
}

/// Resolves profile names to shared, immutable profiles.
#[derive(Clone, Debug)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Arc<ResilienceProfile>>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileRegistry {
    pub fn empty() -> Self {
        Self {
            profiles: BTreeMap::new(),
        }
    }

    /// The four call-site profiles plugins use out of the box.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.insert(
            ResilienceProfile::new(SEARCH)
                .max_retries(2)
                .retry_budget(Some(Duration::from_secs(10)))
                .max_concurrency_per_host(4)
                .max_total_concurrency_per_host(8)
                .per_request_timeout(Some(Duration::from_secs(10))),
        );
        registry.insert(
            ResilienceProfile::new(DETAILS)
                .max_retries(3)
                .retry_budget(Some(Duration::from_secs(15)))
                .max_concurrency_per_host(4)
                .max_total_concurrency_per_host(8)
                .per_request_timeout(Some(Duration::from_secs(10))),
        );
        registry.insert(
            ResilienceProfile::new(CATALOG)
                .max_retries(3)
                .retry_budget(Some(Duration::from_secs(30)))
                .max_concurrency_per_host(2)
                .max_total_concurrency_per_host(8)
                .per_request_timeout(Some(Duration::from_secs(20))),
        );
        registry.insert(
            ResilienceProfile::new(DOWNLOAD)
                .max_retries(5)
                .retry_budget(Some(Duration::from_secs(120)))
                .max_concurrency_per_host(2)
                .max_total_concurrency_per_host(8)
                .per_request_timeout(Some(Duration::from_secs(60)))
                .max_backoff(Duration::from_secs(15)),
        );
        registry
    }

    /// Built-ins overlaid with `[http.profiles.*]`; unknown names become new profiles.
    pub fn from_config(config: &HttpConfig) -> Self {
        let mut registry = Self::builtin();
        for (name, overrides) in &config.profiles {
            let base = registry
                .profiles
                .get(name)
                .map(|existing| existing.as_ref().clone())
                .unwrap_or_else(|| ResilienceProfile::new(name.clone()));
            registry.insert(base.apply(overrides));
        }
        registry
    }

    pub fn insert(&mut self, profile: ResilienceProfile) {
        self.profiles
            .insert(profile.name().to_string(), Arc::new(profile));
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<ResilienceProfile>, HttpError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| HttpError::UnknownProfile {
                name: name.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResilienceProfile>> {
        self.profiles.values()
    }
}
