//! Quota accounting rules and downstream response classification
//!
//! `QuotaPolicy` decides when a key is exhausted from its counters alone, with
//! no I/O, so boundary behaviour can be tested directly. `classify_response` is
//! the one place that reads downstream error bodies; a change in the downstream
//! error format only touches this file.
//!
//! Error bodies follow the Google API shape:
//! `{"error":{"code":403,"message":"...","errors":[{"reason":"quotaExceeded"}]}}`.
//! Bodies that don't parse are classified as transient so a format change
//! never disables a healthy key.

use downstream::TransportError;
use serde::Deserialize;

/// Default per-key daily allowance in quota units.
pub const DEFAULT_DAILY_LIMIT: u64 = 10_000;

/// Default fraction of the daily limit at which a key stops being used.
pub const DEFAULT_SOFT_CEILING: f64 = 0.95;

/// Default number of consecutive failures that disables a key.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// Reasons meaning the key's quota or rate allowance is spent.
const QUOTA_REASONS: &[&str] = &[
    "quotaexceeded",
    "dailylimitexceeded",
    "dailylimitexceededunreg",
    "ratelimitexceeded",
    "userratelimitexceeded",
    "resource_exhausted",
];

/// Reasons meaning the key itself is unusable (invalid, expired, not enabled).
const KEY_REASONS: &[&str] = &[
    "keyinvalid",
    "keyexpired",
    "api_key_invalid",
    "accessnotconfigured",
    "iprefererblocked",
    "forbidden",
    "unauthenticated",
    "permission_denied",
];

/// Exhaustion thresholds for every key in a pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaPolicy {
    pub daily_limit: u64,
    pub soft_ceiling: f64,
    pub error_threshold: u32,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            soft_ceiling: DEFAULT_SOFT_CEILING,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
        }
    }
}

impl QuotaPolicy {
    pub fn new(daily_limit: u64, soft_ceiling: f64, error_threshold: u32) -> Self {
        Self {
            daily_limit,
            soft_ceiling,
            error_threshold,
        }
    }

    /// Whether `used` units have reached the soft ceiling.
    pub fn soft_ceiling_reached(&self, used: u64) -> bool {
        used as f64 >= self.daily_limit as f64 * self.soft_ceiling
    }

    /// Whether `consecutive_errors` have reached the error threshold.
    pub fn error_threshold_reached(&self, consecutive_errors: u32) -> bool {
        consecutive_errors >= self.error_threshold
    }

    /// Combined exhaustion decision from counters.
    pub fn should_exhaust(&self, used: u64, consecutive_errors: u32) -> bool {
        self.soft_ceiling_reached(used) || self.error_threshold_reached(consecutive_errors)
    }

    /// Units left before the hard daily limit.
    pub fn remaining(&self, used: u64) -> u64 {
        self.daily_limit.saturating_sub(used)
    }

    /// Total daily capacity of a pool with `keys` keys.
    pub fn capacity(&self, keys: usize) -> u64 {
        self.daily_limit.saturating_mul(keys as u64)
    }
}

/// Whether a fatal downstream rejection is the key's fault or the request's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalScope {
    /// Auth or key configuration problem; another key may work.
    Key,
    /// Malformed request; every key would fail the same way.
    Request,
}

/// A failed attempt, as classified from the downstream response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Failure {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("fatal error ({status}): {message}")]
    Fatal {
        status: u16,
        message: String,
        scope: FatalScope,
    },
}

impl Failure {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Failure::QuotaExceeded(_) => "quota_exceeded",
            Failure::Transient(_) => "transient",
            Failure::Fatal {
                scope: FatalScope::Key,
                ..
            } => "fatal_key",
            Failure::Fatal {
                scope: FatalScope::Request,
                ..
            } => "fatal_request",
        }
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(serde_json::Value),
    Failed(Failure),
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorObject,
}

#[derive(Deserialize)]
struct ErrorObject {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorObject {
    /// All reason codes, lowercased, including the top-level status.
    fn reasons(&self) -> Vec<String> {
        self.errors
            .iter()
            .filter_map(|e| e.reason.as_deref())
            .chain(self.status.as_deref())
            .map(str::to_lowercase)
            .collect()
    }

    fn describe(&self, status: u16) -> String {
        self.message
            .clone()
            .or_else(|| self.errors.iter().find_map(|e| e.message.clone()))
            .unwrap_or_else(|| format!("downstream returned {status}"))
    }
}

/// Classify a downstream HTTP response.
///
/// - 2xx: success; the body is parsed as JSON (non-JSON bodies become a string)
/// - 4xx with a quota/rate-limit reason: `QuotaExceeded`
/// - 4xx with a key reason, or 401/403: `Fatal` scoped to the key
/// - 408, or 429 without a quota reason: `Transient`
/// - other 4xx with a parseable error body: `Fatal` scoped to the request
/// - 4xx with an unparseable body, 5xx, anything else: `Transient`
pub fn classify_response(status: u16, body: &str) -> Outcome {
    if (200..300).contains(&status) {
        return Outcome::Success(parse_payload(body));
    }
    if !(400..500).contains(&status) {
        return Outcome::Failed(Failure::Transient(format!(
            "downstream returned {status}"
        )));
    }

    let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) else {
        return Outcome::Failed(Failure::Transient(format!(
            "downstream returned {status} with an unrecognized error body"
        )));
    };
    let error = envelope.error;
    let reasons = error.reasons();
    let message = error.describe(status);
    let has_reason = |set: &[&str]| reasons.iter().any(|r| set.contains(&r.as_str()));

    let failure = if has_reason(QUOTA_REASONS) {
        Failure::QuotaExceeded(message)
    } else if has_reason(KEY_REASONS) || status == 401 || status == 403 {
        Failure::Fatal {
            status,
            message,
            scope: FatalScope::Key,
        }
    } else if status == 408 || status == 429 {
        Failure::Transient(message)
    } else {
        Failure::Fatal {
            status,
            message,
            scope: FatalScope::Request,
        }
    };
    Outcome::Failed(failure)
}

/// Classify a transport failure (no HTTP response). Always transient.
pub fn classify_transport(error: &TransportError) -> Failure {
    Failure::Transient(error.to_string())
}

fn parse_payload(body: &str) -> serde_json::Value {
    if body.trim().is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_string()))
}
