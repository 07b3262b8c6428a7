//! Quota Gateway
//!
//! Single-binary service that:
//! 1. Loads a pool of API keys for one quota-limited downstream
//! 2. Accepts logical calls on `POST /v1/execute`
//! 3. Runs each call with failover across keys, tracking daily usage per key
//! 4. Exposes pool status on a separate admin listener

mod admin;
mod api;
mod config;
mod error;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use downstream::HttpDownstream;
use key_pool::{KeyPool, PoolHealth, RequestExecutor, StatusReporter, spawn_reset_task};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::api::{ApiState, ExecuteRequest};
use crate::config::Config;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    api: ApiState,
    reporter: StatusReporter,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the public router.
///
/// The concurrency limit caps in-flight requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/execute", post(execute_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting quota-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.downstream.base_url,
        keys = config.keys.len(),
        daily_limit = config.pool.daily_limit,
        max_attempts = config.pool.max_attempts,
        "configuration loaded"
    );

    let pool = Arc::new(KeyPool::new(
        std::mem::take(&mut config.keys),
        config.pool.policy(),
    ));
    let downstream = Arc::new(HttpDownstream::new(
        reqwest::Client::new(),
        config.downstream.base_url.clone(),
        config.downstream.credential_location,
        config.downstream.credential_name.clone(),
        Duration::from_secs(config.downstream.timeout_secs),
    ));
    let executor = Arc::new(RequestExecutor::with_max_attempts(
        pool.clone(),
        downstream,
        config.pool.max_attempts,
    ));

    let reset_task = config
        .pool
        .reset_interval()
        .map(|interval| spawn_reset_task(pool.clone(), interval));

    let app_state = AppState {
        api: ApiState {
            executor,
            costs: Arc::new(config.costs.clone()),
        },
        reporter: StatusReporter::new(pool.clone()),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    let admin_listener = match config.server.admin_listen_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind admin listener to {addr}"))?,
        ),
        None => None,
    };

    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: the server is
    // told to drain, then the drain races DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let admin_handle = admin_listener.map(|admin_listener| {
        let admin_app = build_admin_router(AdminState::new(pool.clone()));
        if let Ok(addr) = admin_listener.local_addr() {
            info!(addr = %addr, "admin API listening");
        }
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin_app).await {
                error!(error = %e, "admin server error");
            }
        })
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(handle) = admin_handle {
        handle.abort();
    }
    if let Some(handle) = reset_task {
        handle.abort();
    }

    info!("shutdown complete");
    Ok(())
}

/// Returns 200 while at least one key is usable, 503 once the pool is drained.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.reporter.snapshot().await;
    let status_code = if snapshot.status == PoolHealth::Unhealthy {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": snapshot.status.label(),
        "total_keys": snapshot.total_keys,
        "active_keys": snapshot.active_keys,
        "percent_used": snapshot.percent_used,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn execute_handler(
    State(state): State<AppState>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    api::execute(&state.api, body, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
