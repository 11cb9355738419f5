//! Prometheus Metrics Definitions
//!
//! All cachet metrics live in one lazily-registered [`CachetMetrics`]
//! instance on the default Prometheus registry.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

/// Store operation latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s
const STORE_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0];

/// Manager actions include retry delays, so the tail is longer.
const ACTION_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance - initialized on first use
pub static METRICS: Lazy<TelemetryResult<CachetMetrics>> = Lazy::new(CachetMetrics::new);

/// The registered metrics, or the error that kept them from registering.
pub fn metrics() -> TelemetryResult<&'static CachetMetrics> {
    METRICS.as_ref().map_err(Clone::clone)
}

/// Container for all cachet metrics.
#[derive(Clone)]
pub struct CachetMetrics {
    /// Cache operations - labels: cache, operation (get_hit, get_miss, touch, add, update, remove)
    pub cache_operations_total: IntCounterVec,

    /// Entries evicted - labels: cache, reason (size, time)
    pub cache_evictions_total: IntCounterVec,

    /// Current entry count - labels: cache
    pub cache_entries: IntGaugeVec,

    /// Repository operations - labels: collection, operation, status (success, error, conflict)
    pub repository_operations_total: IntCounterVec,

    /// Repository operation duration - labels: collection, operation
    pub repository_operation_duration_seconds: HistogramVec,

    /// Records returned or written by multi-record operations - labels: collection, operation
    pub repository_records_total: IntCounterVec,

    /// Manager actions - labels: action, status (success, error)
    pub manager_actions_total: IntCounterVec,

    /// Manager action duration - labels: action
    pub manager_action_duration_seconds: HistogramVec,

    /// Version-conflict retries - labels: action
    pub manager_retries_total: IntCounterVec,
}

fn registration(metric: &str) -> impl FnOnce(prometheus::Error) -> TelemetryError + '_ {
    move |e| TelemetryError::Registration {
        metric: metric.to_string(),
        reason: e.to_string(),
    }
}

impl CachetMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> TelemetryResult<Self> {
        Ok(Self {
            cache_operations_total: register_int_counter_vec!(
                "cachet_cache_operations_total",
                "Total number of cache operations",
                &["cache", "operation"]
            )
            .map_err(registration("cachet_cache_operations_total"))?,

            cache_evictions_total: register_int_counter_vec!(
                "cachet_cache_evictions_total",
                "Total number of entries evicted from caches",
                &["cache", "reason"]
            )
            .map_err(registration("cachet_cache_evictions_total"))?,

            cache_entries: register_int_gauge_vec!(
                "cachet_cache_entries",
                "Current number of cache entries",
                &["cache"]
            )
            .map_err(registration("cachet_cache_entries"))?,

            repository_operations_total: register_int_counter_vec!(
                "cachet_repository_operations_total",
                "Total number of repository operations",
                &["collection", "operation", "status"]
            )
            .map_err(registration("cachet_repository_operations_total"))?,

            repository_operation_duration_seconds: register_histogram_vec!(
                "cachet_repository_operation_duration_seconds",
                "Repository operation duration in seconds",
                &["collection", "operation"],
                STORE_LATENCY_BUCKETS.to_vec()
            )
            .map_err(registration("cachet_repository_operation_duration_seconds"))?,

            repository_records_total: register_int_counter_vec!(
                "cachet_repository_records_total",
                "Total number of records handled by multi-record operations",
                &["collection", "operation"]
            )
            .map_err(registration("cachet_repository_records_total"))?,

            manager_actions_total: register_int_counter_vec!(
                "cachet_manager_actions_total",
                "Total number of manager actions",
                &["action", "status"]
            )
            .map_err(registration("cachet_manager_actions_total"))?,

            manager_action_duration_seconds: register_histogram_vec!(
                "cachet_manager_action_duration_seconds",
                "Manager action duration in seconds",
                &["action"],
                ACTION_LATENCY_BUCKETS.to_vec()
            )
            .map_err(registration("cachet_manager_action_duration_seconds"))?,

            manager_retries_total: register_int_counter_vec!(
                "cachet_manager_retries_total",
                "Total number of version-conflict retries",
                &["action"]
            )
            .map_err(registration("cachet_manager_retries_total"))?,
        })
    }

    pub fn record_cache_operation(&self, cache: &str, operation: &str) {
        self.cache_operations_total
            .with_label_values(&[cache, operation])
            .inc();
    }

    pub fn record_cache_eviction(&self, cache: &str, reason: &str, removed: usize) {
        self.cache_evictions_total
            .with_label_values(&[cache, reason])
            .inc_by(removed as u64);
    }

    pub fn set_cache_entries(&self, cache: &str, count: usize) {
        self.cache_entries
            .with_label_values(&[cache])
            .set(count as i64);
    }

    /// Record a completed repository operation.
    pub fn record_repository_operation(
        &self,
        collection: &str,
        operation: &str,
        duration_secs: f64,
        records: Option<usize>,
    ) {
        self.repository_operations_total
            .with_label_values(&[collection, operation, "success"])
            .inc();
        self.repository_operation_duration_seconds
            .with_label_values(&[collection, operation])
            .observe(duration_secs);
        if let Some(records) = records {
            self.repository_records_total
                .with_label_values(&[collection, operation])
                .inc_by(records as u64);
        }
    }

    /// Record a failed repository operation. Version mismatches count as
    /// `conflict`, everything else as `error`.
    pub fn record_repository_failure(
        &self,
        collection: &str,
        operation: &str,
        is_version_mismatch: bool,
    ) {
        let status = if is_version_mismatch { "conflict" } else { "error" };
        self.repository_operations_total
            .with_label_values(&[collection, operation, status])
            .inc();
    }

    pub fn record_manager_action(&self, action: &str, ok: bool, duration_secs: f64) {
        let status = if ok { "success" } else { "error" };
        self.manager_actions_total
            .with_label_values(&[action, status])
            .inc();
        self.manager_action_duration_seconds
            .with_label_values(&[action])
            .observe(duration_secs);
    }

    pub fn record_manager_retry(&self, action: &str) {
        self.manager_retries_total
            .with_label_values(&[action])
            .inc();
    }
}

/// Encode everything on the default registry in the Prometheus text format.
pub fn gather_metrics() -> TelemetryResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        tracing::error!(error = %e, "Failed to encode metrics");
        TelemetryError::Encoding(e.to_string())
    })?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    #[test]
    fn test_metrics_creation() -> Result<(), String> {
        let metrics = metrics().map_err(|e| format!("Metrics init failed: {e}"))?;
        assert!(!metrics.cache_operations_total.desc().is_empty());
        Ok(())
    }

    #[test]
    fn test_second_registration_fails() -> Result<(), String> {
        metrics().map_err(|e| format!("Metrics init failed: {e}"))?;
        assert!(matches!(
            CachetMetrics::new(),
            Err(TelemetryError::Registration { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_cache_metrics() -> Result<(), String> {
        let metrics = metrics().map_err(|e| format!("Metrics init failed: {e}"))?;
        metrics.record_cache_operation("metrics-test-cache", "add");
        metrics.record_cache_operation("metrics-test-cache", "add");
        metrics.record_cache_eviction("metrics-test-cache", "size", 3);
        metrics.set_cache_entries("metrics-test-cache", 7);

        let adds = metrics
            .cache_operations_total
            .with_label_values(&["metrics-test-cache", "add"])
            .get();
        assert_eq!(adds, 2);
        let evicted = metrics
            .cache_evictions_total
            .with_label_values(&["metrics-test-cache", "size"])
            .get();
        assert_eq!(evicted, 3);
        assert_eq!(
            metrics
                .cache_entries
                .with_label_values(&["metrics-test-cache"])
                .get(),
            7
        );
        Ok(())
    }

    #[test]
    fn test_repository_metrics() -> Result<(), String> {
        let metrics = metrics().map_err(|e| format!("Metrics init failed: {e}"))?;
        metrics.record_repository_operation("metrics-test-coll", "get_many", 0.004, Some(5));
        metrics.record_repository_failure("metrics-test-coll", "update", true);
        metrics.record_repository_failure("metrics-test-coll", "update", false);

        let records = metrics
            .repository_records_total
            .with_label_values(&["metrics-test-coll", "get_many"])
            .get();
        assert_eq!(records, 5);
        for status in ["conflict", "error"] {
            let n = metrics
                .repository_operations_total
                .with_label_values(&["metrics-test-coll", "update", status])
                .get();
            assert_eq!(n, 1, "{status}");
        }
        Ok(())
    }

    #[test]
    fn test_gather_includes_registered_metrics() -> Result<(), String> {
        let metrics = metrics().map_err(|e| format!("Metrics init failed: {e}"))?;
        metrics.record_manager_action("metrics-test-action", true, 0.01);

        let text = gather_metrics().map_err(|e| e.to_string())?;
        assert!(text.contains("cachet_manager_actions_total"));
        assert!(text.contains("metrics-test-action"));
        Ok(())
    }
}
