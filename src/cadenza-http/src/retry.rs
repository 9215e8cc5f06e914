use std::time::{Duration, Instant, SystemTime};

use http::header::{HeaderMap, RETRY_AFTER};
use http::StatusCode;
use rand::Rng;

use crate::profile::ResilienceProfile;

/// How the executor treats a received status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    /// 1xx-3xx, including 304 revalidation answers.
    Success,
    /// 429 and 5xx.
    Retryable,
    /// 401; retried exactly once when a credential refresher is installed.
    Unauthorized,
    /// Any other 4xx. Repeating the request will not help.
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    match status.as_u16() {
        429 => StatusClass::Retryable,
        401 => StatusClass::Unauthorized,
        400..=499 => StatusClass::NonRetryable,
        500..=599 => StatusClass::Retryable,
        _ => StatusClass::Success,
    }
}

/// Both forms a Retry-After may take. A response can carry more than one
/// header value, so both may be present at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryAfter {
    /// Remaining time until an HTTP-date, floored at zero.
    pub absolute: Option<Duration>,
    /// A delta-seconds value.
    pub relative: Option<Duration>,
}

impl RetryAfter {
    /// The absolute date wins when both forms are present.
    pub fn delay(&self) -> Option<Duration> {
        self.absolute.or(self.relative)
    }
}

pub fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<RetryAfter> {
    let mut hint = RetryAfter::default();
    for raw in headers.get_all(RETRY_AFTER) {
        let Ok(text) = raw.to_str() else {
            continue;
        };
        let text = text.trim();
        if let Ok(seconds) = text.parse::<u64>() {
            hint.relative = Some(Duration::from_secs(seconds));
        } else if let Ok(date) = httpdate::parse_http_date(text) {
            hint.absolute = Some(date.duration_since(now).unwrap_or(Duration::ZERO));
        }
    }
    if hint.absolute.is_none() && hint.relative.is_none() {
        return None;
    }
    Some(hint)
}

/// Exponential backoff with jitter for the `retry_index`-th retry (1-based),
/// never exceeding the profile's max backoff.
pub fn backoff_delay(profile: &ResilienceProfile, retry_index: u32) -> Duration {
    let exponent = retry_index.saturating_sub(1).min(31);
    let base_ms = profile.configured_base_backoff().as_millis().max(1);
    let max_ms = profile.configured_max_backoff().as_millis().max(base_ms);
    let delay_ms = base_ms
        .saturating_mul(1_u128 << exponent)
        .min(max_ms)
        .min(u64::MAX as u128) as u64;
    apply_jitter(delay_ms, max_ms as u64, profile.configured_jitter_ratio())
}

fn apply_jitter(delay_ms: u64, max_ms: u64, jitter_ratio: f64) -> Duration {
    if jitter_ratio <= f64::EPSILON || delay_ms <= 1 {
        return Duration::from_millis(delay_ms);
    }
    let span = ((delay_ms as f64) * jitter_ratio).round().max(1.0) as u64;
    let low = delay_ms.saturating_sub(span);
    let high = delay_ms.saturating_add(span).max(low);
    let sampled = rand::thread_rng().gen_range(low..=high);
    Duration::from_millis(sampled.min(max_ms.max(1)))
}

/// Wall-clock allowance for one logical call's retries.
#[derive(Clone, Copy, Debug)]
pub struct RetryBudget {
    started_at: Instant,
    limit: Option<Duration>,
}

impl RetryBudget {
    pub fn start(limit: Option<Duration>) -> Self {
        Self {
            started_at: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|limit| limit.saturating_sub(self.started_at.elapsed()))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_some_and(|remaining| remaining.is_zero())
    }

    /// Shortens `delay` to what is left of the budget; `None` once nothing is left.
    pub fn clamp(&self, delay: Duration) -> Option<Duration> {
        match self.remaining() {
            None => Some(delay),
            Some(remaining) if remaining.is_zero() => None,
            Some(remaining) => Some(delay.min(remaining)),
        }
    }
}
