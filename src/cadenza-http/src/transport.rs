use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use cadenza_core::redact::redact_url;
use reqwest::Client;

use crate::error::{TransportError, TransportErrorKind};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// The single "send a request, get a response" primitive the engine drives.
///
/// Any HTTP status is a successful send; only failures that produced no
/// response at all are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|error| classify(&error))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone());
        if let Some(body) = request.body_bytes() {
            builder = builder.body(body.clone());
        }
        let response = builder.send().await.map_err(|error| classify(&error))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|error| classify(&error))?;
        Ok(HttpResponse::new(status, headers, body))
    }
}

fn classify(error: &reqwest::Error) -> TransportError {
    let mut detail = error_chain(error);
    if let Some(url) = error.url() {
        detail = detail.replace(url.as_str(), &redact_url(url));
    }
    let lowered = detail.to_ascii_lowercase();
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if lowered.contains("dns error") || lowered.contains("failed to lookup address") {
        TransportErrorKind::Dns
    } else if lowered.contains("certificate") || lowered.contains("tls") {
        TransportErrorKind::Tls
    } else if error.is_connect() {
        TransportErrorKind::Connect
    } else if error.is_body() || error.is_decode() {
        TransportErrorKind::Body
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, detail)
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
