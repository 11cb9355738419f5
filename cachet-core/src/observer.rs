//! Observer seams for metrics
//!
//! Caches, repositories and managers report what they do through these
//! traits. Every method has a no-op default, so implementors override only
//! what they record. Callers treat observers as best-effort: a panicking
//! observer is caught and logged, never allowed to fail the operation.

use std::time::Duration;

/// Receives cache activity. `name` identifies the cache instance.
pub trait CacheObserver: Send + Sync {
    fn keys_count(&self, _name: &str, _count: usize) {}
    fn on_get(&self, _name: &str, _missed: bool) {}
    fn on_touch(&self, _name: &str) {}
    fn on_add(&self, _name: &str) {}
    fn on_update(&self, _name: &str) {}
    fn on_remove(&self, _name: &str) {}
    fn on_cleanup_by_size(&self, _name: &str, _removed: usize) {}
    fn on_cleanup_by_time(&self, _name: &str, _removed: usize) {}
}

/// Receives repository timings. `collection` names the backing collection.
///
/// Counts are `None` when the operation does not know how many records it
/// touched.
pub trait RepositoryObserver: Send + Sync {
    fn on_get(&self, _collection: &str, _elapsed: Duration) {}
    fn on_get_failed(&self, _collection: &str) {}
    fn on_get_many(&self, _collection: &str, _elapsed: Duration, _count: Option<usize>) {}
    fn on_get_many_failed(&self, _collection: &str) {}
    fn on_get_all(&self, _collection: &str, _elapsed: Duration, _count: Option<usize>) {}
    fn on_get_all_failed(&self, _collection: &str) {}
    fn on_search(&self, _collection: &str, _elapsed: Duration, _count: Option<usize>) {}
    fn on_search_failed(&self, _collection: &str) {}
    fn on_count(&self, _collection: &str, _elapsed: Duration) {}
    fn on_count_failed(&self, _collection: &str) {}
    fn on_create(&self, _collection: &str, _elapsed: Duration) {}
    fn on_create_failed(&self, _collection: &str, _is_version_mismatch: bool) {}
    fn on_update(&self, _collection: &str, _elapsed: Duration) {}
    fn on_update_failed(&self, _collection: &str, _is_version_mismatch: bool) {}
    fn on_bulk_update(&self, _collection: &str, _elapsed: Duration, _count: Option<usize>) {}
    fn on_bulk_update_failed(&self, _collection: &str, _is_version_mismatch: bool) {}
    fn on_delete(&self, _collection: &str, _elapsed: Duration) {}
    fn on_delete_failed(&self, _collection: &str, _is_version_mismatch: bool) {}
    fn on_delete_many(&self, _collection: &str, _elapsed: Duration, _count: Option<usize>) {}
    fn on_delete_many_failed(&self, _collection: &str, _is_version_mismatch: bool) {}
}

/// Receives manager-level actions (`update`, `delete`, `bulk_update`, ...).
pub trait ManagerObserver: Send + Sync {
    fn on_action(&self, _action: &str, _elapsed: Duration, _ok: bool) {}
    fn on_retry(&self, _action: &str, _attempt: u32) {}
}

/// Observer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCacheObserver;

impl CacheObserver for NullCacheObserver {}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullRepositoryObserver;

impl RepositoryObserver for NullRepositoryObserver {}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullManagerObserver;

impl ManagerObserver for NullManagerObserver {}

/// Run an observer callback, swallowing and logging any panic.
pub fn notify<F: FnOnce()>(what: &str, f: F) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(callback = what, error = %message, "Observer callback panicked");
    }
}
