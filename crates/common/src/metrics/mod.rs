//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with standardized naming conventions
//! for the workflow pipeline and its adapters.

use metrics::{describe_counter, describe_histogram, Unit};

/// Metrics prefix for all Careforge metrics
pub const METRICS_PREFIX: &str = "careforge";

/// Buckets for adapter call latency (LLM and provider calls are slow)
pub const ADAPTER_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_documents_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of documents created"
    );

    describe_counter!(
        format!("{}_document_transitions_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of document state transitions"
    );

    describe_counter!(
        format!("{}_adapter_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of retried adapter calls"
    );

    describe_histogram!(
        format!("{}_adapter_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Adapter call latency in seconds"
    );

    describe_counter!(
        format!("{}_status_polls_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of envelope status polls"
    );

    describe_counter!(
        format!("{}_status_events_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of envelope status events reconciled"
    );

    describe_counter!(
        format!("{}_sweeps_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of status sweep runs"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        // Descriptions may be registered repeatedly without a recorder
        register_metrics();
        register_metrics();
    }
}
