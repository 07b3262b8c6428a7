//! Shared fixtures for unit tests

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Secret;
use downstream::{Downstream, DownstreamRequest, RawResponse, TransportError};

use crate::pool::Clock;

/// `n` distinct test keys, `test-api-key-0000` onwards.
pub(crate) fn keys(n: usize) -> Vec<Secret<String>> {
    (0..n)
        .map(|i| Secret::new(format!("test-api-key-{i:04}")))
        .collect()
}

/// Clock pinned to a settable instant.
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn at(rfc3339: &str) -> Self {
        Self {
            now: Mutex::new(parse(rfc3339)),
        }
    }

    pub(crate) fn set(&self, rfc3339: &str) {
        *self.now.lock().unwrap() = parse(rfc3339);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

fn parse(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

pub(crate) fn ok(body: &str) -> Result<RawResponse, TransportError> {
    Ok(RawResponse {
        status: 200,
        body: body.to_string(),
    })
}

pub(crate) fn status(status: u16, body: &str) -> Result<RawResponse, TransportError> {
    Ok(RawResponse {
        status,
        body: body.to_string(),
    })
}

pub(crate) const QUOTA_BODY: &str =
    r#"{"error":{"code":403,"message":"quota exceeded","errors":[{"reason":"quotaExceeded"}]}}"#;

/// Downstream that replays scripted results in order and records which
/// credential each call used. Once the script runs out it answers `fallback`.
pub(crate) struct ScriptedDownstream {
    script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    fallback: Result<RawResponse, TransportError>,
    calls: Mutex<Vec<String>>,
    latency: Duration,
}

impl ScriptedDownstream {
    pub(crate) fn new(script: Vec<Result<RawResponse, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: ok(r#"{"ok":true}"#),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Always succeeds after `latency`.
    pub(crate) fn always_ok(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::new(vec![])
        }
    }

    /// Credentials used, in call order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Downstream for ScriptedDownstream {
    fn id(&self) -> &str {
        "scripted"
    }

    fn call<'a>(
        &'a self,
        _request: &'a DownstreamRequest,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = downstream::Result<RawResponse>> + Send + 'a>> {
        self.calls.lock().unwrap().push(credential.to_string());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            next
        })
    }
}
