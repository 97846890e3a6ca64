//! Prometheus metrics exposition
//!
//! - `studio_requests_total` (counter): labels `operation`, `outcome`
//! - `studio_generation_duration_seconds` (histogram): label `operation`
//!
//! The key pool records `pool_keys_exhausted_total` and
//! `pool_failovers_total` through the same global recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "studio_generation_duration_seconds";

/// Text calls finish in seconds, video polling can run for minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record one facade operation with its outcome (`ok` or an error type).
pub fn record_operation(operation: &'static str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!("studio_requests_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "operation" => operation).record(duration_secs);
}
