//! Prometheus metrics exposition
//!
//! The key-pool library emits its counters through the `metrics` facade; this
//! module installs the recorder that renders them and adds the gateway's own:
//!
//! - `gateway_requests_total` (counter): labels `endpoint`, `result`. The
//!   endpoint label is a `[costs]` table key or `other`.
//! - `gateway_request_duration_seconds` (histogram): label `result`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms up to the longest multi-attempt call we expect.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `gateway_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram with `_bucket` lines instead of a summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record one execute call. `endpoint` is the label from
/// `CostTable::metric_label`; `result` is `success` or the error kind.
pub fn record_request(endpoint: &str, result: &'static str, duration_secs: f64) {
    metrics::counter!(
        "gateway_requests_total",
        "endpoint" => endpoint.to_string(),
        "result" => result
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "result" => result)
        .record(duration_secs);
}
