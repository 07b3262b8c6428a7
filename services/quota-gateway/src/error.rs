//! Per-request error responses
//!
//! Every failure leaves the gateway as `{"error":{"type","message","request_id"}}`.
//! Executor errors keep their variant as the `type` so callers can tell "wait
//! for the daily reset" apart from "the downstream is unhealthy".

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Days, Utc};
use key_pool::ExecutorError;

/// Errors returned by the execute endpoint.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Executor(e) => match e {
                ExecutorError::PoolExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
                ExecutorError::AllAttemptsFailed { .. } => StatusCode::BAD_GATEWAY,
                ExecutorError::RequestRejected { .. } => StatusCode::BAD_REQUEST,
                ExecutorError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Executor(e) => e.kind(),
        }
    }

    /// Render as a JSON error response tagged with `request_id`.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        self.render(request_id, Utc::now())
    }

    fn render(self, request_id: &str, now: DateTime<Utc>) -> Response {
        let status = self.status();
        let mut error = serde_json::json!({
            "type": self.kind(),
            "message": self.to_string(),
            "request_id": request_id,
        });

        let retry_after = match &self {
            GatewayError::Executor(ExecutorError::PoolExhausted { .. }) => {
                Some(seconds_until_reset(now))
            }
            _ => None,
        };
        if let Some(secs) = retry_after {
            error["retry_after_secs"] = secs.into();
        }

        let mut response = (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": error }).to_string(),
        )
            .into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Seconds from `now` until the next UTC midnight, when keys reset. At least 1.
pub fn seconds_until_reset(now: DateTime<Utc>) -> u64 {
    let next_midnight = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc());
    match next_midnight {
        Some(midnight) => (midnight - now).num_seconds().max(1) as u64,
        None => 1,
    }
}
