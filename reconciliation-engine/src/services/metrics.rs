//! Prometheus metrics for reconciliation-engine.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for processed chunks by mode.
pub static CHUNKS_PROCESSED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_chunks_total",
        "Total number of chunks classified",
        &["mode"]
    )
    .expect("Failed to register CHUNKS_PROCESSED")
});

/// Counter for oracle calls by provider and status.
pub static ORACLE_CALLS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_oracle_calls_total",
        "Total number of oracle invocations",
        &["provider", "status"]
    )
    .expect("Failed to register ORACLE_CALLS")
});

/// Histogram for oracle call duration by provider.
pub static ORACLE_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_oracle_call_duration_seconds",
        "Oracle call duration in seconds, including retries",
        &["provider"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("Failed to register ORACLE_CALL_DURATION")
});

/// Counter for final verdicts by bucket and source.
pub static VERDICTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_verdicts_total",
        "Total number of verdicts in final reports",
        &["bucket", "source"]
    )
    .expect("Failed to register VERDICTS")
});

/// Counter for reconciliation runs.
pub static RECONCILIATION_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_runs_total",
        "Total number of reconciliation runs",
        &["status"]
    )
    .expect("Failed to register RECONCILIATION_RUNS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&CHUNKS_PROCESSED);
    Lazy::force(&ORACLE_CALLS);
    Lazy::force(&ORACLE_CALL_DURATION);
    Lazy::force(&VERDICTS);
    Lazy::force(&RECONCILIATION_RUNS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_chunk(mode: &str) {
    CHUNKS_PROCESSED.with_label_values(&[mode]).inc();
}

pub fn record_oracle_call(provider: &str, status: &str, duration_secs: f64) {
    ORACLE_CALLS.with_label_values(&[provider, status]).inc();
    ORACLE_CALL_DURATION
        .with_label_values(&[provider])
        .observe(duration_secs);
}

pub fn record_verdict(bucket: &str, source: &str) {
    VERDICTS.with_label_values(&[bucket, source]).inc();
}

pub fn record_run(status: &str) {
    RECONCILIATION_RUNS.with_label_values(&[status]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
