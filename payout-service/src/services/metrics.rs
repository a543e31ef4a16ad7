//! Prometheus metrics for payout-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "payout_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register db_query_duration")
});

/// Ledger mutations by operation and outcome.
pub static LEDGER_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payout_ledger_operations_total",
        "Total number of ledger mutations",
        &["operation", "status"]
    )
    .expect("Failed to register ledger_operations")
});

/// Weekly bonus imports by final status.
pub static BONUS_IMPORTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payout_bonus_imports_total",
        "Total number of weekly bonus imports",
        &["status"]
    )
    .expect("Failed to register bonus_imports")
});

/// Payment instructions created by batch export.
pub static PAYMENTS_EXPORTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payout_payments_exported_total",
        "Total number of payment instructions exported",
        &["path"]  // standard, unverified
    )
    .expect("Failed to register payments_exported")
});

/// Settlement rows by classification.
pub static SETTLEMENT_ROWS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payout_settlement_rows_total",
        "Total number of settlement rows by outcome",
        &["phase", "outcome"]
    )
    .expect("Failed to register settlement_rows")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payout_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&LEDGER_OPERATIONS);
    Lazy::force(&BONUS_IMPORTS);
    Lazy::force(&PAYMENTS_EXPORTED);
    Lazy::force(&SETTLEMENT_ROWS);
    Lazy::force(&ERRORS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

pub fn record_ledger_operation(operation: &str, status: &str) {
    LEDGER_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_import(status: &str) {
    BONUS_IMPORTS.with_label_values(&[status]).inc();
}

pub fn record_payments_exported(path: &str, count: usize) {
    PAYMENTS_EXPORTED
        .with_label_values(&[path])
        .inc_by(count as f64);
}

pub fn record_settlement_row(phase: &str, outcome: &str) {
    SETTLEMENT_ROWS.with_label_values(&[phase, outcome]).inc();
}

pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}
