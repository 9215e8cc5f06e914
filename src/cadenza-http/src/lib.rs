//! Resilient HTTP execution for streaming-service plugins.
//!
//! A single [`ResilientExecutor`] owns the response cache, the single-flight
//! map, the per-host concurrency gate and the rate-limit hints. Plugins build
//! one at startup and route every outbound call through it.

pub mod auth;
pub mod cache;
pub mod canonical;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod gate;
pub mod metrics;
pub mod profile;
pub mod rate_limit;
pub mod request;
pub mod response;
pub mod retry;
pub mod sleeper;
pub mod transport;
mod util;

pub use auth::{CredentialError, CredentialRefresher, StaticBearer};
pub use cache::{
    CacheEntry, CacheKey, CacheLookup, CachePolicy, CachePolicyProvider, ConditionalRequestState,
    ConfigCachePolicy, InMemoryConditionalState, NoCachePolicy, ResponseCache, Validators,
};
pub use canonical::{canonicalize, CanonicalKey, KeyPolicy};
pub use dedup::RequestDeduplicator;
pub use error::{HttpError, HttpResult, TimeoutPhase, TransportError, TransportErrorKind};
pub use executor::{ExecutorBuilder, ExecutorSettings, ResilientExecutor};
pub use gate::{HostConcurrencyGate, HostPermit};
pub use metrics::{InMemoryMetrics, Metrics, MetricsSink, MetricsSnapshot};
pub use profile::{ProfileRegistry, ResilienceProfile};
pub use rate_limit::{RateLimitObserver, RateLimitSink};
pub use request::HttpRequest;
pub use response::HttpResponse;
pub use retry::{RetryAfter, RetryBudget, StatusClass};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
pub use transport::{ReqwestTransport, Transport};
pub use tokio_util::sync::CancellationToken;
