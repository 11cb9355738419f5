//! Observer implementations backed by [`CachetMetrics`].

use crate::error::TelemetryResult;
use crate::metrics::{metrics, CachetMetrics};
use cachet_core::{CacheObserver, ManagerObserver, RepositoryObserver};
use std::time::Duration;

/// Cache activity as Prometheus counters and an entry gauge.
#[derive(Clone)]
pub struct PrometheusCacheObserver {
    metrics: &'static CachetMetrics,
}

impl PrometheusCacheObserver {
    pub fn new() -> TelemetryResult<Self> {
        Ok(Self {
            metrics: metrics()?,
        })
    }
}

impl CacheObserver for PrometheusCacheObserver {
    fn keys_count(&self, name: &str, count: usize) {
        self.metrics.set_cache_entries(name, count);
    }

    fn on_get(&self, name: &str, missed: bool) {
        let operation = if missed { "get_miss" } else { "get_hit" };
        self.metrics.record_cache_operation(name, operation);
    }

    fn on_touch(&self, name: &str) {
        self.metrics.record_cache_operation(name, "touch");
    }

    fn on_add(&self, name: &str) {
        self.metrics.record_cache_operation(name, "add");
    }

    fn on_update(&self, name: &str) {
        self.metrics.record_cache_operation(name, "update");
    }

    fn on_remove(&self, name: &str) {
        self.metrics.record_cache_operation(name, "remove");
    }

    fn on_cleanup_by_size(&self, name: &str, removed: usize) {
        self.metrics.record_cache_eviction(name, "size", removed);
    }

    fn on_cleanup_by_time(&self, name: &str, removed: usize) {
        self.metrics.record_cache_eviction(name, "time", removed);
    }
}

/// Repository timings as Prometheus histograms and status counters.
#[derive(Clone)]
pub struct PrometheusRepositoryObserver {
    metrics: &'static CachetMetrics,
}

impl PrometheusRepositoryObserver {
    pub fn new() -> TelemetryResult<Self> {
        Ok(Self {
            metrics: metrics()?,
        })
    }

    fn ok(&self, collection: &str, operation: &str, elapsed: Duration, count: Option<usize>) {
        self.metrics
            .record_repository_operation(collection, operation, elapsed.as_secs_f64(), count);
    }

    fn failed(&self, collection: &str, operation: &str, is_version_mismatch: bool) {
        self.metrics
            .record_repository_failure(collection, operation, is_version_mismatch);
    }
}

impl RepositoryObserver for PrometheusRepositoryObserver {
    fn on_get(&self, collection: &str, elapsed: Duration) {
        self.ok(collection, "get", elapsed, None);
    }
    fn on_get_failed(&self, collection: &str) {
        self.failed(collection, "get", false);
    }
    fn on_get_many(&self, collection: &str, elapsed: Duration, count: Option<usize>) {
        self.ok(collection, "get_many", elapsed, count);
    }
    fn on_get_many_failed(&self, collection: &str) {
        self.failed(collection, "get_many", false);
    }
    fn on_get_all(&self, collection: &str, elapsed: Duration, count: Option<usize>) {
        self.ok(collection, "get_all", elapsed, count);
    }
    fn on_get_all_failed(&self, collection: &str) {
        self.failed(collection, "get_all", false);
    }
    fn on_search(&self, collection: &str, elapsed: Duration, count: Option<usize>) {
        self.ok(collection, "search", elapsed, count);
    }
    fn on_search_failed(&self, collection: &str) {
        self.failed(collection, "search", false);
    }
    fn on_count(&self, collection: &str, elapsed: Duration) {
        self.ok(collection, "count", elapsed, None);
    }
    fn on_count_failed(&self, collection: &str) {
        self.failed(collection, "count", false);
    }
    fn on_create(&self, collection: &str, elapsed: Duration) {
        self.ok(collection, "create", elapsed, None);
    }
    fn on_create_failed(&self, collection: &str, is_version_mismatch: bool) {
        self.failed(collection, "create", is_version_mismatch);
    }
    fn on_update(&self, collection: &str, elapsed: Duration) {
        self.ok(collection, "update", elapsed, None);
    }
    fn on_update_failed(&self, collection: &str, is_version_mismatch: bool) {
        self.failed(collection, "update", is_version_mismatch);
    }
    fn on_bulk_update(&self, collection: &str, elapsed: Duration, count: Option<usize>) {
        self.ok(collection, "bulk_update", elapsed, count);
    }
    fn on_bulk_update_failed(&self, collection: &str, is_version_mismatch: bool) {
        self.failed(collection, "bulk_update", is_version_mismatch);
    }
    fn on_delete(&self, collection: &str, elapsed: Duration) {
        self.ok(collection, "delete", elapsed, None);
    }
    fn on_delete_failed(&self, collection: &str, is_version_mismatch: bool) {
        self.failed(collection, "delete", is_version_mismatch);
    }
    fn on_delete_many(&self, collection: &str, elapsed: Duration, count: Option<usize>) {
        self.ok(collection, "delete_many", elapsed, count);
    }
    fn on_delete_many_failed(&self, collection: &str, is_version_mismatch: bool) {
        self.failed(collection, "delete_many", is_version_mismatch);
    }
}

/// Manager actions and retries.
#[derive(Clone)]
pub struct PrometheusManagerObserver {
    metrics: &'static CachetMetrics,
}

impl PrometheusManagerObserver {
    pub fn new() -> TelemetryResult<Self> {
        Ok(Self {
            metrics: metrics()?,
        })
    }
}

impl ManagerObserver for PrometheusManagerObserver {
    fn on_action(&self, action: &str, elapsed: Duration, ok: bool) {
        self.metrics
            .record_manager_action(action, ok, elapsed.as_secs_f64());
    }

    fn on_retry(&self, action: &str, _attempt: u32) {
        self.metrics.record_manager_retry(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_observer_counts_hits_and_misses() {
        let observer = PrometheusCacheObserver::new().unwrap();
        let metrics = metrics().unwrap();
        observer.on_get("observer-test-cache", true);
        observer.on_get("observer-test-cache", false);
        observer.on_get("observer-test-cache", false);
        observer.on_cleanup_by_time("observer-test-cache", 10);
        observer.keys_count("observer-test-cache", 4);

        let hits = metrics
            .cache_operations_total
            .with_label_values(&["observer-test-cache", "get_hit"])
            .get();
        let misses = metrics
            .cache_operations_total
            .with_label_values(&["observer-test-cache", "get_miss"])
            .get();
        assert_eq!((hits, misses), (2, 1));
        assert_eq!(
            metrics
                .cache_evictions_total
                .with_label_values(&["observer-test-cache", "time"])
                .get(),
            10
        );
        assert_eq!(
            metrics
                .cache_entries
                .with_label_values(&["observer-test-cache"])
                .get(),
            4
        );
    }

    #[test]
    fn test_repository_observer_classifies_failures() {
        let observer = PrometheusRepositoryObserver::new().unwrap();
        let metrics = metrics().unwrap();
        observer.on_update("observer-test-coll", Duration::from_millis(3));
        observer.on_update_failed("observer-test-coll", true);
        observer.on_delete_failed("observer-test-coll", false);
        observer.on_search("observer-test-coll", Duration::from_millis(1), Some(12));

        let status = |operation: &str, status: &str| {
            metrics
                .repository_operations_total
                .with_label_values(&["observer-test-coll", operation, status])
                .get()
        };
        assert_eq!(status("update", "success"), 1);
        assert_eq!(status("update", "conflict"), 1);
        assert_eq!(status("delete", "error"), 1);
        assert_eq!(
            metrics
                .repository_records_total
                .with_label_values(&["observer-test-coll", "search"])
                .get(),
            12
        );
        let samples = metrics
            .repository_operation_duration_seconds
            .with_label_values(&["observer-test-coll", "update"])
            .get_sample_count();
        assert_eq!(samples, 1);
    }

    #[test]
    fn test_manager_observer_counts_retries() {
        let observer = PrometheusManagerObserver::new().unwrap();
        let metrics = metrics().unwrap();
        observer.on_retry("observer-test-action", 1);
        observer.on_retry("observer-test-action", 2);
        observer.on_action("observer-test-action", Duration::from_millis(5), false);

        assert_eq!(
            metrics
                .manager_retries_total
                .with_label_values(&["observer-test-action"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .manager_actions_total
                .with_label_values(&["observer-test-action", "error"])
                .get(),
            1
        );
    }
}
