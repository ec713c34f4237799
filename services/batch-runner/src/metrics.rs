//! Prometheus metrics exposition
//!
//! Installs the process-wide recorder that the library crates' `metrics`
//! calls land in, and defines the batch runner's own series:
//!
//! - `batch_items_total` (counter): label `status`
//! - `batch_input_items` (gauge)

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Item duration buckets, 50ms to 5 minutes. A single item can spend several
/// retry backoffs plus a slow completion call.
const ITEM_DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(dispatch::metrics::ITEM_DURATION_SECONDS.to_string()),
        ITEM_DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `dispatch_item_duration_seconds` gets explicit buckets so it renders as a
/// histogram rather than the default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record the final status of one batch item.
pub fn record_item(status: &'static str) {
    metrics::counter!("batch_items_total", "status" => status).increment(1);
}

pub fn set_input_items(count: usize) {
    metrics::gauge!("batch_input_items").set(count as f64);
}
