//! Metrics module
//!
//! Prometheus counters for sessions, range requests and retries.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

lazy_static! {
    // Session metrics
    pub static ref SESSIONS_TOTAL: CounterVec = register_counter_vec!(
        "tus_sessions_total",
        "Upload sessions by outcome",
        &["outcome"]  // "started", "succeeded", "paused", "cancelled"
    ).unwrap();

    pub static ref INVALID_OPERATIONS: CounterVec = register_counter_vec!(
        "tus_invalid_operations_total",
        "Controller operations ignored because the session state did not allow them",
        &["operation"]
    ).unwrap();

    // Range metrics
    pub static ref RANGE_REQUESTS: CounterVec = register_counter_vec!(
        "tus_range_requests_total",
        "PATCH attempts by result",
        &["status"]
    ).unwrap();

    pub static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "tus_range_retries_total",
        "Retries of transient failures",
        &["operation"]
    ).unwrap();

    pub static ref BYTES_ACKNOWLEDGED: Counter = register_counter!(
        "tus_bytes_acknowledged_total",
        "Bytes the server acknowledged through PATCH"
    ).unwrap();

    pub static ref RANGE_DURATION: Histogram = register_histogram!(
        "tus_range_duration_seconds",
        "Range transfer duration in seconds, retries included",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();
}

/// Record a session reaching `outcome`
pub fn record_session(outcome: &str) {
    SESSIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record an ignored controller operation
pub fn record_invalid_operation(operation: &str) {
    INVALID_OPERATIONS.with_label_values(&[operation]).inc();
}

/// Record one PATCH attempt
pub fn record_range_request(status: &str) {
    RANGE_REQUESTS.with_label_values(&[status]).inc();
}

/// Record a retry of `operation`
pub fn record_retry(operation: &str) {
    RETRIES_TOTAL.with_label_values(&[operation]).inc();
}

/// Record bytes acknowledged by the server
pub fn record_bytes_acknowledged(bytes: u64) {
    BYTES_ACKNOWLEDGED.inc_by(bytes as f64);
}

/// Record range duration
pub fn record_range_duration(duration_secs: f64) {
    RANGE_DURATION.observe(duration_secs);
}

/// Render the default registry in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
