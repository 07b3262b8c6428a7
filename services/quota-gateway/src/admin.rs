//! Admin API for pool inspection
//!
//! Runs on a separate listener (`server.admin_listen_addr`) so it can stay off
//! the public interface.
//!
//! Endpoints:
//! - GET  /admin/status: per-key usage snapshot
//! - POST /admin/reset: clear every key's daily counters now

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use key_pool::{KeyPool, StatusReporter};
use tracing::info;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<KeyPool>,
    reporter: StatusReporter,
}

impl AdminState {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        let reporter = StatusReporter::new(pool.clone());
        Self { pool, reporter }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(pool_status))
        .route("/admin/reset", post(force_reset))
        .with_state(state)
}

async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    (StatusCode::OK, axum::Json(state.reporter.snapshot().await))
}

/// Operator override for a downstream that reset early, or a key that was
/// disabled by a burst of errors.
async fn force_reset(State(state): State<AdminState>) -> impl IntoResponse {
    state.pool.force_reset().await;
    info!("daily counters reset by admin request");
    (StatusCode::OK, axum::Json(state.reporter.snapshot().await))
}
