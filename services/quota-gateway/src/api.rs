//! Execute endpoint
//!
//! `POST /v1/execute` runs one logical downstream call through the key pool.
//! Units come from the request, else the `[costs]` table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use downstream::DownstreamRequest;
use key_pool::{ExecuteOptions, RequestExecutor};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::config::CostTable;
use crate::error::GatewayError;
use crate::metrics;

#[derive(Clone)]
pub struct ApiState {
    pub executor: Arc<RequestExecutor>,
    pub costs: Arc<CostTable>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    pub endpoint: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub estimated_units: Option<u64>,
    pub max_attempts: Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    payload: serde_json::Value,
    key: String,
    attempts: u32,
    units: u64,
    request_id: String,
}

/// Endpoints are relative paths under the configured base URL.
fn validate_endpoint(endpoint: &str) -> Result<(), GatewayError> {
    let trimmed = endpoint.trim_matches('/');
    if trimmed.is_empty() {
        return Err(GatewayError::InvalidRequest("endpoint must not be empty".into()));
    }
    if trimmed.contains("://") || trimmed.split('/').any(|segment| segment == "..") {
        return Err(GatewayError::InvalidRequest(format!(
            "endpoint must be a relative path, got: {endpoint}"
        )));
    }
    if trimmed.contains('?') {
        return Err(GatewayError::InvalidRequest(
            "query parameters belong in params, not in endpoint".into(),
        ));
    }
    Ok(())
}

#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn execute(
    state: &ApiState,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
    request_id: String,
) -> Response {
    let start = Instant::now();

    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "rejected malformed execute request");
            return GatewayError::InvalidRequest(rejection.body_text())
                .into_response_with_id(&request_id);
        }
    };

    if let Err(e) = validate_endpoint(&body.endpoint) {
        warn!(endpoint = %body.endpoint, error = %e, "rejected execute request");
        return e.into_response_with_id(&request_id);
    }

    let endpoint = body.endpoint.trim_matches('/').to_string();
    let units = body
        .estimated_units
        .unwrap_or_else(|| state.costs.units_for(&endpoint));
    let label = state.costs.metric_label(&endpoint);

    let mut options = ExecuteOptions::new(units);
    if let Some(max_attempts) = body.max_attempts {
        options = options.max_attempts(max_attempts);
    }
    if let Some(ms) = body.timeout_ms {
        options = options.deadline(start + Duration::from_millis(ms));
    }

    let request = DownstreamRequest {
        endpoint: endpoint.clone(),
        params: body.params,
    };

    let result = state.executor.execute_with(&request, options).await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(response) => {
            metrics::record_request(label, "success", elapsed);
            info!(
                endpoint = %endpoint,
                key = %response.key,
                attempts = response.attempts,
                units = response.units,
                "execute succeeded"
            );
            (
                StatusCode::OK,
                Json(ExecuteResponse {
                    payload: response.payload,
                    key: response.key,
                    attempts: response.attempts,
                    units: response.units,
                    request_id,
                }),
            )
                .into_response()
        }
        Err(e) => {
            let err = GatewayError::from(e);
            metrics::record_request(label, err.kind(), elapsed);
            warn!(endpoint = %endpoint, error = %err, "execute failed");
            err.into_response_with_id(&request_id)
        }
    }
}
