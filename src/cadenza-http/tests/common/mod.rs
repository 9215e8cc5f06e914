#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cadenza_http::{HttpRequest, HttpResponse, Transport, TransportError};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;

pub enum Step {
    Respond(HttpResponse),
    Fail(TransportError),
    Hang,
}

pub fn response(status: u16, body: &'static str) -> HttpResponse {
    response_with(status, &[], body)
}

pub fn response_with(status: u16, headers: &[(&str, &str)], body: &'static str) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::from_bytes(name.as_bytes()).expect("header name"),
            HeaderValue::from_str(value).expect("header value"),
        );
    }
    HttpResponse::new(
        StatusCode::from_u16(status).expect("status"),
        map,
        Bytes::from_static(body.as_bytes()),
    )
}

/// In-process transport replaying scripted steps, then answering 200 "ok".
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Self::with_delay(steps, Duration::ZERO)
    }

    pub fn with_delay(steps: Vec<Step>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            delay,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().expect("seen lock").push(request);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        let step = self.steps.lock().expect("steps lock").pop_front();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let outcome = match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(response(200, "late"))
            }
            None => Ok(response(200, "ok")),
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}
