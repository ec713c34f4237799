//! Dispatch metrics
//!
//! Emitted through the `metrics` facade; the binary decides where they go.
//!
//! - `dispatch_invocations_total` (counter): label `outcome`
//! - `dispatch_retries_total` (counter): label `reason`
//! - `dispatch_items_total` (counter): label `outcome`
//! - `dispatch_in_flight` (gauge)
//! - `dispatch_item_duration_seconds` (histogram)

/// Histogram name, exported so the binary can configure its buckets.
pub const ITEM_DURATION_SECONDS: &str = "dispatch_item_duration_seconds";

/// Record how one invocation ended ("success", "tolerated_empty", "failure").
pub fn record_invocation(outcome: &'static str) {
    ::metrics::counter!("dispatch_invocations_total", "outcome" => outcome).increment(1);
}

/// Record one retry and why it happened.
pub fn record_retry(reason: &'static str) {
    ::metrics::counter!("dispatch_retries_total", "reason" => reason).increment(1);
}

pub fn item_started() {
    ::metrics::gauge!("dispatch_in_flight").increment(1.0);
}

/// Record a finished work item ("completed" or "failed").
pub fn item_finished(outcome: &'static str, duration_secs: f64) {
    ::metrics::gauge!("dispatch_in_flight").decrement(1.0);
    ::metrics::counter!("dispatch_items_total", "outcome" => outcome).increment(1);
    ::metrics::histogram!(ITEM_DURATION_SECONDS).record(duration_secs);
}
