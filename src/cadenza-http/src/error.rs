use http::StatusCode;
use thiserror::Error;

use crate::response::HttpResponse;

/// Failure classes reported by a [`Transport`](crate::Transport).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Connect,
    Dns,
    Tls,
    Timeout,
    Body,
    Other,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Dns => "dns",
            Self::Tls => "tls",
            Self::Timeout => "timeout",
            Self::Body => "body",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A send attempt that produced no HTTP response at all.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// A single send exceeded the profile's per-request timeout.
    Attempt,
    /// The retry budget ran out before a usable response arrived.
    Budget,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Attempt => "attempt",
            Self::Budget => "budget",
        };
        formatter.write_str(text)
    }
}

/// Errors surfaced by the execution engine.
///
/// `Clone` so a single leader outcome can be handed to every joiner of a
/// deduplicated call.
#[derive(Clone, Debug, Error)]
pub enum HttpError {
    #[error("request rejected with status {status}")]
    NonRetryable {
        status: StatusCode,
        response: HttpResponse,
    },
    #[error("status {status} after {attempts} attempt(s)")]
    RetriesExhausted {
        status: StatusCode,
        attempts: u32,
        response: HttpResponse,
    },
    #[error("transport failed after {attempts} attempt(s): {source}")]
    Transport {
        source: TransportError,
        attempts: u32,
    },
    #[error("{phase} timeout after {attempts} attempt(s)")]
    Timeout { phase: TimeoutPhase, attempts: u32 },
    #[error("in-flight request {key} expired before its leader completed")]
    LeaderExpired { key: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("unknown resilience profile: {name}")]
    UnknownProfile { name: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl HttpError {
    /// The last response observed before the call gave up, if any.
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Self::NonRetryable { response, .. } | Self::RetriesExhausted { response, .. } => {
                Some(response)
            }
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(HttpResponse::status)
    }

    /// Number of sends performed; zero when the call never reached the transport.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::NonRetryable { .. } => 1,
            Self::RetriesExhausted { attempts, .. }
            | Self::Transport { attempts, .. }
            | Self::Timeout { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type HttpResult<T> = Result<T, HttpError>;
