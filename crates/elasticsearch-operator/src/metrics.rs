//! Operator metrics
//!
//! Handles are created once and cloned into every worker. Queue-level
//! metrics (depth, adds, retries) are emitted by [`crate::queue`] directly.

/// Metrics for the reconciliation loop
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Counter for specs rejected by the validator
    pub rejections: metrics::Counter,
    /// Counter for teardowns of deleted clusters
    pub deletions: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("elasticsearch_operator_reconciliations_total"),
            errors: metrics::counter!("elasticsearch_operator_reconciliation_errors_total"),
            rejections: metrics::counter!("elasticsearch_operator_spec_rejections_total"),
            deletions: metrics::counter!("elasticsearch_operator_deletions_total"),
            duration: metrics::histogram!("elasticsearch_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
