//! The orchestrator tying cache, single-flight, gate, cooldowns and retries together.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use cadenza_core::redact::redact_url;
use cadenza_core::HttpConfig;
use http::header::{HeaderValue, AUTHORIZATION, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{Method, StatusCode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialRefresher;
use crate::cache::{
    CacheLookup, CachePolicy, CachePolicyProvider, ConditionalRequestState,
    InMemoryConditionalState, NoCachePolicy, ResponseCache, Validators,
};
use crate::canonical::{canonicalize, selected_headers, sorted_query_pairs, KeyPolicy};
use crate::dedup::RequestDeduplicator;
use crate::error::{HttpError, HttpResult, TimeoutPhase, TransportError};
use crate::gate::HostConcurrencyGate;
use crate::metrics::{Metrics, AUTH_REFRESHES, RETRY_COUNT};
use crate::profile::{ProfileRegistry, ResilienceProfile};
use crate::rate_limit::{RateLimitObserver, RateLimitSink};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::retry::{backoff_delay, classify_status, parse_retry_after, RetryBudget, StatusClass};
use crate::sleeper::{sleep_or_cancel, Sleeper, TokioSleeper};
use crate::transport::Transport;

/// Engine-wide knobs that are not part of any single profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub dedup_request_timeout: Duration,
    pub dedup_sweep_interval: Duration,
    pub max_cooldown: Duration,
    pub key_headers: Vec<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&HttpConfig::default())
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            dedup_request_timeout: Duration::from_millis(config.dedup_request_timeout_ms),
            dedup_sweep_interval: Duration::from_millis(config.dedup_sweep_interval_ms),
            max_cooldown: Duration::from_millis(config.max_cooldown_ms),
            key_headers: config.key_headers.clone(),
        }
    }
}

pub struct ExecutorBuilder {
    transport: Arc<dyn Transport>,
    profiles: ProfileRegistry,
    cache_policy: Arc<dyn CachePolicyProvider>,
    conditional: Arc<dyn ConditionalRequestState>,
    key_policy: Option<KeyPolicy>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    metrics: Metrics,
    sleeper: Arc<dyn Sleeper>,
    rate_limit_sink: Option<Arc<dyn RateLimitSink>>,
    settings: ExecutorSettings,
}

impl ExecutorBuilder {
    pub fn profiles(mut self, profiles: ProfileRegistry) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn cache_policy(mut self, policy: Arc<dyn CachePolicyProvider>) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn conditional_state(mut self, state: Arc<dyn ConditionalRequestState>) -> Self {
        self.conditional = state;
        self
    }

    /// Overrides the key policy otherwise derived from `settings.key_headers`.
    pub fn key_policy(mut self, policy: KeyPolicy) -> Self {
        self.key_policy = Some(policy);
        self
    }

    pub fn credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn rate_limit_sink(mut self, sink: Arc<dyn RateLimitSink>) -> Self {
        self.rate_limit_sink = Some(sink);
        self
    }

    pub fn settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> ResilientExecutor {
        let key_policy = self
            .key_policy
            .unwrap_or_else(|| KeyPolicy::from_names(&self.settings.key_headers));
        let mut observer = RateLimitObserver::new(self.settings.max_cooldown);
        if let Some(sink) = self.rate_limit_sink {
            observer = observer.with_sink(sink);
        }
        ResilientExecutor {
            transport: self.transport,
            profiles: self.profiles,
            cache: ResponseCache::new(self.cache_policy, self.conditional, self.metrics.clone()),
            gate: HostConcurrencyGate::new(self.metrics.clone()),
            observer,
            dedup: Arc::new(RequestDeduplicator::new()),
            key_policy,
            refresher: self.refresher,
            sleeper: self.sleeper,
            metrics: self.metrics,
            settings: self.settings,
        }
    }
}

/// Long-lived engine instance. Construct once and share it (typically behind
/// an `Arc`) between every call site of a plugin.
pub struct ResilientExecutor {
    transport: Arc<dyn Transport>,
    profiles: ProfileRegistry,
    cache: ResponseCache,
    gate: HostConcurrencyGate,
    observer: RateLimitObserver,
    dedup: Arc<RequestDeduplicator<HttpResponse>>,
    key_policy: KeyPolicy,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Metrics,
    settings: ExecutorSettings,
}

impl std::fmt::Debug for ResilientExecutor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResilientExecutor")
            .field("cache", &self.cache)
            .field("dedup", &self.dedup)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Where a cacheable call lives in the response cache.
struct CacheSlot {
    endpoint: String,
    params: Vec<(String, String)>,
    policy: CachePolicy,
}

enum AttemptFailure {
    Transport(TransportError),
    Timeout(TimeoutPhase),
    Cancelled,
}

impl ResilientExecutor {
    pub fn builder(transport: Arc<dyn Transport>) -> ExecutorBuilder {
        ExecutorBuilder {
            transport,
            profiles: ProfileRegistry::builtin(),
            cache_policy: Arc::new(NoCachePolicy),
            conditional: Arc::new(InMemoryConditionalState::new()),
            key_policy: None,
            refresher: None,
            metrics: Metrics::disabled(),
            sleeper: Arc::new(TokioSleeper),
            rate_limit_sink: None,
            settings: ExecutorSettings::default(),
        }
    }

    /// A builder preloaded from the `[http]` configuration section.
    pub fn configured(transport: Arc<dyn Transport>, config: &HttpConfig) -> ExecutorBuilder {
        Self::builder(transport)
            .profiles(ProfileRegistry::from_config(config))
            .cache_policy(Arc::new(crate::cache::ConfigCachePolicy::from_config(
                &config.cache,
            )))
            .settings(ExecutorSettings::from_config(config))
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn gate(&self) -> &HostConcurrencyGate {
        &self.gate
    }

    pub fn rate_limits(&self) -> &RateLimitObserver {
        &self.observer
    }

    pub fn in_flight_requests(&self) -> usize {
        self.dedup.in_flight_count()
    }

    /// Starts the background sweep of hung single-flight entries.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.dedup
            .spawn_sweeper(self.settings.dedup_sweep_interval, shutdown)
    }

    /// [`execute_with_resilience`](Self::execute_with_resilience) under a named profile.
    pub async fn execute(
        &self,
        request: HttpRequest,
        profile: &str,
        cancel: &CancellationToken,
    ) -> HttpResult<HttpResponse> {
        let profile = self.profiles.resolve(profile)?;
        self.execute_with_resilience(request, &profile, cancel).await
    }

    /// Runs `request` through the cache, the single-flight group for its
    /// canonical key, the host gate and the retry loop.
    ///
    /// Successful and 3xx responses are returned as `Ok`. A 4xx other than
    /// 429 fails with [`HttpError::NonRetryable`] on the first attempt; 429
    /// and 5xx fail with [`HttpError::RetriesExhausted`] once `max_retries`
    /// or the retry budget runs out.
    pub async fn execute_with_resilience(
        &self,
        mut request: HttpRequest,
        profile: &ResilienceProfile,
        cancel: &CancellationToken,
    ) -> HttpResult<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }
        let host = request.host_key().ok_or_else(|| HttpError::InvalidRequest {
            message: "url has no host".to_string(),
        })?;

        let slot = self.cache_slot(&request, &host);
        let mut stale = None;
        if let Some(slot) = &slot {
            match self.cache.try_get(&slot.endpoint, &slot.params) {
                CacheLookup::Fresh(response) => return Ok(response),
                CacheLookup::Stale { value, validators } => {
                    stale = Some(value);
                    add_conditional_headers(&mut request, &validators);
                }
                CacheLookup::Miss => {}
            }
        }

        let key = canonicalize(&request, &self.key_policy);
        self.dedup
            .execute(
                key,
                self.settings.dedup_request_timeout,
                || self.lead(request, profile, host, slot, stale, cancel),
                cancel,
            )
            .await
    }

    async fn lead(
        &self,
        request: HttpRequest,
        profile: &ResilienceProfile,
        host: String,
        slot: Option<CacheSlot>,
        stale: Option<HttpResponse>,
        cancel: &CancellationToken,
    ) -> HttpResult<HttpResponse> {
        let permit = self.gate.acquire(&host, profile, cancel).await?;
        let outcome = self.send_with_retry(request, profile, &host, cancel).await;
        self.gate.release(permit);
        let response = outcome?;
        Ok(match slot {
            Some(slot) => self.update_cache(&slot, stale, response),
            None => response,
        })
    }

    async fn send_with_retry(
        &self,
        mut request: HttpRequest,
        profile: &ResilienceProfile,
        host: &str,
        cancel: &CancellationToken,
    ) -> HttpResult<HttpResponse> {
        let url = redact_url(request.url());
        let max_retries = profile.configured_max_retries();
        let budget = RetryBudget::start(profile.configured_retry_budget());
        let mut attempts: u32 = 0;
        let mut retries: u32 = 0;
        let mut refreshed = false;
        // set once the budget has shortened a wait; that attempt is the last
        let mut final_attempt = false;

        loop {
            if let Some(cooldown) = self.observer.get_cooldown(host) {
                let wait = budget.clamp(cooldown).unwrap_or(Duration::ZERO);
                final_attempt |= budget_spent_by(&budget, wait);
                tracing::debug!(
                    host = %host,
                    wait_ms = wait.as_millis() as u64,
                    "waiting out host cooldown"
                );
                sleep_or_cancel(self.sleeper.as_ref(), wait, cancel).await?;
            }

            attempts += 1;
            tracing::debug!(url = %url, attempt = attempts, profile = profile.name(), "sending request");

            let attempt_budget = (!final_attempt).then_some(&budget);
            let (failure, delay) = match self.send_once(request.clone(), profile, attempt_budget, cancel).await {
                Err(AttemptFailure::Cancelled) => return Err(HttpError::Cancelled),
                Err(AttemptFailure::Transport(source)) => {
                    (HttpError::Transport { source, attempts }, None)
                }
                Err(AttemptFailure::Timeout(phase)) => (HttpError::Timeout { phase, attempts }, None),
                Ok(response) => match classify_status(response.status()) {
                    StatusClass::Success => return Ok(response),
                    StatusClass::NonRetryable => {
                        return Err(HttpError::NonRetryable {
                            status: response.status(),
                            response,
                        })
                    }
                    StatusClass::Unauthorized => {
                        if !refreshed && self.refresh_credentials(&mut request, host, cancel).await? {
                            refreshed = true;
                            continue;
                        }
                        return Err(HttpError::NonRetryable {
                            status: response.status(),
                            response,
                        });
                    }
                    StatusClass::Retryable => {
                        let status = response.status();
                        let hint = parse_retry_after(response.headers(), SystemTime::now())
                            .and_then(|hint| hint.delay());
                        let delay = hint.unwrap_or_else(|| backoff_delay(profile, retries + 1));
                        // a bare 429 still throttles the host for the computed backoff
                        if hint.is_some() || status == StatusCode::TOO_MANY_REQUESTS {
                            self.observer.record_retry_after(host, delay, Instant::now());
                        }
                        (
                            HttpError::RetriesExhausted {
                                status,
                                attempts,
                                response,
                            },
                            Some(delay),
                        )
                    }
                },
            };

            if retries >= max_retries {
                return Err(failure);
            }
            if final_attempt || budget.is_exhausted() {
                tracing::warn!(
                    url = %url,
                    attempts,
                    elapsed_ms = budget.elapsed().as_millis() as u64,
                    "retry budget exhausted"
                );
                return Err(failure);
            }
            let wanted = delay.unwrap_or_else(|| backoff_delay(profile, retries + 1));
            let delay = budget.clamp(wanted).unwrap_or(Duration::ZERO);
            final_attempt = budget_spent_by(&budget, delay);

            retries += 1;
            self.metrics.increment(RETRY_COUNT, Some(host));
            tracing::warn!(
                url = %url,
                attempt = attempts,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying request"
            );
            sleep_or_cancel(self.sleeper.as_ref(), delay, cancel).await?;
        }
    }

    /// `budget` is `None` for the attempt that follows a budget-shortened wait;
    /// that attempt runs under the per-request timeout alone.
    async fn send_once(
        &self,
        request: HttpRequest,
        profile: &ResilienceProfile,
        budget: Option<&RetryBudget>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, AttemptFailure> {
        let remaining = budget
            .and_then(RetryBudget::remaining)
            .filter(|remaining| !remaining.is_zero());
        let (limit, phase) = match (profile.configured_per_request_timeout(), remaining) {
            (Some(per_request), Some(remaining)) if remaining < per_request => {
                (Some(remaining), TimeoutPhase::Budget)
            }
            (Some(per_request), _) => (Some(per_request), TimeoutPhase::Attempt),
            (None, Some(remaining)) => (Some(remaining), TimeoutPhase::Budget),
            (None, None) => (None, TimeoutPhase::Attempt),
        };
        let send = self.transport.send(request);
        let attempt = async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, send).await {
                    Ok(result) => result.map_err(AttemptFailure::Transport),
                    Err(_) => Err(AttemptFailure::Timeout(phase)),
                },
                None => send.await.map_err(AttemptFailure::Transport),
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttemptFailure::Cancelled),
            result = attempt => result,
        }
    }

    /// Returns `Ok(true)` when a fresh credential was installed on `request`.
    async fn refresh_credentials(
        &self,
        request: &mut HttpRequest,
        host: &str,
        cancel: &CancellationToken,
    ) -> HttpResult<bool> {
        let Some(refresher) = &self.refresher else {
            return Ok(false);
        };
        let refreshed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            refreshed = refresher.refresh(host) => refreshed,
        };
        match refreshed {
            Ok(value) => {
                self.metrics.increment(AUTH_REFRESHES, Some(host));
                tracing::info!(host = %host, "credentials refreshed after 401");
                request.headers_mut().insert(AUTHORIZATION, value);
                Ok(true)
            }
            Err(error) => {
                tracing::warn!(host = %host, error = %error, "credential refresh failed");
                Ok(false)
            }
        }
    }

    fn cache_slot(&self, request: &HttpRequest, host: &str) -> Option<CacheSlot> {
        if !request.is_cacheable_method() {
            return None;
        }
        let mut params = sorted_query_pairs(request.url());
        // representation-selecting headers split entries the same way they split keys
        params.extend(
            selected_headers(request, &self.key_policy)
                .into_iter()
                .map(|(name, value)| (format!(":header:{name}"), value)),
        );
        if *request.method() == Method::HEAD {
            params.push((":method".to_string(), Method::HEAD.to_string()));
        }
        let endpoint = match request.endpoint_name() {
            Some(name) => name.to_string(),
            None => format!("{host}{}", request.url().path()),
        };
        let policy = self.cache.policy_for(&endpoint, &params);
        if !policy.should_cache || policy.ttl.is_zero() {
            return None;
        }
        Some(CacheSlot {
            endpoint,
            params,
            policy,
        })
    }

    fn update_cache(
        &self,
        slot: &CacheSlot,
        stale: Option<HttpResponse>,
        response: HttpResponse,
    ) -> HttpResponse {
        if response.status() == StatusCode::NOT_MODIFIED {
            let Some(stale) = stale else {
                return response;
            };
            if !self.cache.revalidate(
                &slot.endpoint,
                &slot.params,
                response.etag(),
                response.last_modified(),
            ) {
                // entry vanished while the conditional request was in flight
                self.cache
                    .set(&slot.endpoint, &slot.params, stale.clone(), slot.policy.ttl);
            }
            tracing::debug!(endpoint = %slot.endpoint, "cache entry revalidated");
            return stale;
        }
        if response.status().is_success() {
            if stale.is_some() {
                self.cache.record_miss();
            }
            self.cache.set(
                &slot.endpoint,
                &slot.params,
                response.clone(),
                slot.policy.ttl,
            );
        }
        response
    }
}

/// Whether sleeping `wait` uses up what is left of `budget`.
fn budget_spent_by(budget: &RetryBudget, wait: Duration) -> bool {
    budget.remaining().is_some_and(|remaining| wait >= remaining)
}

fn add_conditional_headers(request: &mut HttpRequest, validators: &Validators) {
    let headers = request.headers_mut();
    if let Some(etag) = validators.etag.as_deref() {
        if let Ok(value) = HeaderValue::from_str(etag) {
            headers.entry(IF_NONE_MATCH).or_insert(value);
        }
    }
    if let Some(last_modified) = validators.last_modified.as_deref() {
        if let Ok(value) = HeaderValue::from_str(last_modified) {
            headers.entry(IF_MODIFIED_SINCE).or_insert(value);
        }
    }
}
