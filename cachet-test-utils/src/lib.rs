//! CACHET Test Utilities
//!
//! Shared test infrastructure for the cachet workspace:
//! - A `Widget` entity and fixtures for common scenarios
//! - `InstrumentedStore`, a backing store wrapper that counts calls and
//!   injects faults and latency
//! - Recording observers
//! - Proptest generators
//! - Custom assertions for cachet errors

pub use cachet_core::{
    CacheObserver, CacheSettings, CachetError, CachetResult, ConcurrencyError, EntityHolder,
    FilterExpr, HasId, ManagerObserver, RepositoryObserver, Specification, StoreError, Versioned,
};
pub use cachet_storage::{
    BackingStore, BulkWriteOutcome, CacheTag, CachedRepository, MemoryStore, StoreFilter, WriteOp,
};

use async_trait::async_trait;
use cachet_core::{Entity, SearchResult};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

// ============================================================================
// WIDGET ENTITY
// ============================================================================

/// Small versioned entity used across the workspace tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub id: String,
    pub data_version: i64,
    pub name: String,
    pub color: String,
    pub weight: i64,
}

impl Widget {
    /// A new widget at version 1.
    pub fn new(id: impl Into<String>, color: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: format!("widget {id}"),
            id,
            data_version: 1,
            color: color.into(),
            weight: 0,
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.data_version = version;
        self
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    /// The same widget one version later, recolored.
    pub fn next(&self, color: impl Into<String>) -> Self {
        Self {
            data_version: self.data_version + 1,
            color: color.into(),
            ..self.clone()
        }
    }
}

impl HasId for Widget {
    type Id = String;

    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Versioned for Widget {
    fn data_version(&self) -> i64 {
        self.data_version
    }

    fn set_data_version(&mut self, version: i64) {
        self.data_version = version;
    }
}

// ============================================================================
// INSTRUMENTED STORE
// ============================================================================

/// Per-method call counts of an [`InstrumentedStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub find_by_key: usize,
    pub query: usize,
    pub count: usize,
    pub conditional_replace: usize,
    pub insert: usize,
    pub upsert: usize,
    pub delete: usize,
    pub delete_many: usize,
    pub bulk_write: usize,
}

impl CallCounts {
    pub fn reads(&self) -> usize {
        self.find_by_key + self.query + self.count
    }

    pub fn writes(&self) -> usize {
        self.conditional_replace
            + self.insert
            + self.upsert
            + self.delete
            + self.delete_many
            + self.bulk_write
    }

    pub fn total(&self) -> usize {
        self.reads() + self.writes()
    }
}

#[derive(Debug, Default)]
struct Counters {
    find_by_key: AtomicUsize,
    query: AtomicUsize,
    count: AtomicUsize,
    conditional_replace: AtomicUsize,
    insert: AtomicUsize,
    upsert: AtomicUsize,
    delete: AtomicUsize,
    delete_many: AtomicUsize,
    bulk_write: AtomicUsize,
}

/// [`BackingStore`] wrapper that counts every call and can inject latency
/// and failures.
pub struct InstrumentedStore<R: Entity, S = MemoryStore<R>> {
    inner: S,
    counters: Counters,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
    lost_replaces: AtomicUsize,
    latency: Duration,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Entity> InstrumentedStore<R> {
    /// Instrumented in-memory store.
    pub fn memory(collection: impl Into<String>) -> Self {
        Self::new(MemoryStore::new(collection))
    }
}

impl<R, S> InstrumentedStore<R, S>
where
    R: Entity,
    S: BackingStore<R>,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            counters: Counters::default(),
            failing_reads: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
            lost_replaces: AtomicUsize::new(0),
            latency: Duration::ZERO,
            _marker: PhantomData,
        }
    }

    /// Sleep this long before every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn counts(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            find_by_key: c.find_by_key.load(Ordering::SeqCst),
            query: c.query.load(Ordering::SeqCst),
            count: c.count.load(Ordering::SeqCst),
            conditional_replace: c.conditional_replace.load(Ordering::SeqCst),
            insert: c.insert.load(Ordering::SeqCst),
            upsert: c.upsert.load(Ordering::SeqCst),
            delete: c.delete.load(Ordering::SeqCst),
            delete_many: c.delete_many.load(Ordering::SeqCst),
            bulk_write: c.bulk_write.load(Ordering::SeqCst),
        }
    }

    pub fn reset_counts(&self) {
        let c = &self.counters;
        for counter in [
            &c.find_by_key,
            &c.query,
            &c.count,
            &c.conditional_replace,
            &c.insert,
            &c.upsert,
            &c.delete,
            &c.delete_many,
            &c.bulk_write,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// Fail the next `n` read calls with `StoreError::Unavailable`.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` write calls with `StoreError::Unavailable`.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` conditional replaces match nothing, as if another
    /// writer had moved the record on first. The record is left untouched.
    pub fn lose_next_replaces(&self, n: usize) {
        self.lost_replaces.store(n, Ordering::SeqCst);
    }

    async fn enter(&self, counter: &AtomicUsize, faults: &AtomicUsize) -> CachetResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let injected = faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable {
                reason: "injected fault".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl<R, S> BackingStore<R> for InstrumentedStore<R, S>
where
    R: Entity,
    S: BackingStore<R>,
{
    fn collection_name(&self) -> &str {
        self.inner.collection_name()
    }

    async fn find_by_key(&self, id: &R::Id) -> CachetResult<Option<R>> {
        self.enter(&self.counters.find_by_key, &self.failing_reads).await?;
        self.inner.find_by_key(id).await
    }

    async fn query(
        &self,
        filter: &StoreFilter<R::Id>,
        limit: Option<usize>,
    ) -> CachetResult<SearchResult<R>> {
        self.enter(&self.counters.query, &self.failing_reads).await?;
        self.inner.query(filter, limit).await
    }

    async fn count(&self, filter: &StoreFilter<R::Id>, limit: Option<usize>) -> CachetResult<u64> {
        self.enter(&self.counters.count, &self.failing_reads).await?;
        self.inner.count(filter, limit).await
    }

    async fn conditional_replace(
        &self,
        filter: &StoreFilter<R::Id>,
        record: &R,
    ) -> CachetResult<u64> {
        self.enter(&self.counters.conditional_replace, &self.failing_writes)
            .await?;
        let lost = self
            .lost_replaces
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Ok(0);
        }
        self.inner.conditional_replace(filter, record).await
    }

    async fn insert(&self, record: &R) -> CachetResult<()> {
        self.enter(&self.counters.insert, &self.failing_writes).await?;
        self.inner.insert(record).await
    }

    async fn upsert(&self, record: &R) -> CachetResult<()> {
        self.enter(&self.counters.upsert, &self.failing_writes).await?;
        self.inner.upsert(record).await
    }

    async fn delete(&self, id: &R::Id) -> CachetResult<Option<R>> {
        self.enter(&self.counters.delete, &self.failing_writes).await?;
        self.inner.delete(id).await
    }

    async fn delete_many(&self, filter: &StoreFilter<R::Id>) -> CachetResult<u64> {
        self.enter(&self.counters.delete_many, &self.failing_writes).await?;
        self.inner.delete_many(filter).await
    }

    async fn bulk_write(
        &self,
        ops: Vec<WriteOp<R>>,
        ordered: bool,
    ) -> CachetResult<BulkWriteOutcome> {
        self.enter(&self.counters.bulk_write, &self.failing_writes).await?;
        self.inner.bulk_write(ops, ordered).await
    }
}

// ============================================================================
// RECORDING OBSERVERS
// ============================================================================

pub mod observers {
    //! Observers that record every callback as a short string.

    use super::*;

    fn push(events: &Mutex<Vec<String>>, event: String) {
        events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn snapshot(events: &Mutex<Vec<String>>) -> Vec<String> {
        events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records cache callbacks: `get:hit`, `get:miss`, `add`, `update`,
    /// `remove`, `cleanup_by_size:N`, `cleanup_by_time:N`. Touches and key
    /// counts are only counted.
    #[derive(Debug, Default)]
    pub struct RecordingCacheObserver {
        events: Mutex<Vec<String>>,
        touches: AtomicUsize,
        last_keys_count: AtomicUsize,
    }

    impl RecordingCacheObserver {
        pub fn events(&self) -> Vec<String> {
            snapshot(&self.events)
        }

        pub fn count(&self, event: &str) -> usize {
            self.events().iter().filter(|e| *e == event).count()
        }

        pub fn touches(&self) -> usize {
            self.touches.load(Ordering::SeqCst)
        }

        pub fn last_keys_count(&self) -> usize {
            self.last_keys_count.load(Ordering::SeqCst)
        }
    }

    impl CacheObserver for RecordingCacheObserver {
        fn keys_count(&self, _name: &str, count: usize) {
            self.last_keys_count.store(count, Ordering::SeqCst);
        }
        fn on_get(&self, _name: &str, missed: bool) {
            push(&self.events, if missed { "get:miss" } else { "get:hit" }.to_string());
        }
        fn on_touch(&self, _name: &str) {
            self.touches.fetch_add(1, Ordering::SeqCst);
        }
        fn on_add(&self, _name: &str) {
            push(&self.events, "add".to_string());
        }
        fn on_update(&self, _name: &str) {
            push(&self.events, "update".to_string());
        }
        fn on_remove(&self, _name: &str) {
            push(&self.events, "remove".to_string());
        }
        fn on_cleanup_by_size(&self, _name: &str, removed: usize) {
            push(&self.events, format!("cleanup_by_size:{removed}"));
        }
        fn on_cleanup_by_time(&self, _name: &str, removed: usize) {
            push(&self.events, format!("cleanup_by_time:{removed}"));
        }
    }

    /// Records repository callbacks by operation name, with a `_failed`
    /// suffix on failure and `:vm` when the failure was a version mismatch.
    #[derive(Debug, Default)]
    pub struct RecordingRepositoryObserver {
        events: Mutex<Vec<String>>,
    }

    impl RecordingRepositoryObserver {
        pub fn events(&self) -> Vec<String> {
            snapshot(&self.events)
        }

        pub fn count(&self, event: &str) -> usize {
            self.events().iter().filter(|e| *e == event).count()
        }

        fn ok(&self, op: &str) {
            push(&self.events, op.to_string());
        }

        fn failed(&self, op: &str, is_version_mismatch: bool) {
            let suffix = if is_version_mismatch { ":vm" } else { "" };
            push(&self.events, format!("{op}_failed{suffix}"));
        }
    }

    impl RepositoryObserver for RecordingRepositoryObserver {
        fn on_get(&self, _c: &str, _e: Duration) {
            self.ok("get");
        }
        fn on_get_failed(&self, _c: &str) {
            self.failed("get", false);
        }
        fn on_get_many(&self, _c: &str, _e: Duration, _n: Option<usize>) {
            self.ok("get_many");
        }
        fn on_get_many_failed(&self, _c: &str) {
            self.failed("get_many", false);
        }
        fn on_get_all(&self, _c: &str, _e: Duration, _n: Option<usize>) {
            self.ok("get_all");
        }
        fn on_get_all_failed(&self, _c: &str) {
            self.failed("get_all", false);
        }
        fn on_search(&self, _c: &str, _e: Duration, _n: Option<usize>) {
            self.ok("search");
        }
        fn on_search_failed(&self, _c: &str) {
            self.failed("search", false);
        }
        fn on_count(&self, _c: &str, _e: Duration) {
            self.ok("count");
        }
        fn on_count_failed(&self, _c: &str) {
            self.failed("count", false);
        }
        fn on_create(&self, _c: &str, _e: Duration) {
            self.ok("create");
        }
        fn on_create_failed(&self, _c: &str, vm: bool) {
            self.failed("create", vm);
        }
        fn on_update(&self, _c: &str, _e: Duration) {
            self.ok("update");
        }
        fn on_update_failed(&self, _c: &str, vm: bool) {
            self.failed("update", vm);
        }
        fn on_bulk_update(&self, _c: &str, _e: Duration, _n: Option<usize>) {
            self.ok("bulk_update");
        }
        fn on_bulk_update_failed(&self, _c: &str, vm: bool) {
            self.failed("bulk_update", vm);
        }
        fn on_delete(&self, _c: &str, _e: Duration) {
            self.ok("delete");
        }
        fn on_delete_failed(&self, _c: &str, vm: bool) {
            self.failed("delete", vm);
        }
        fn on_delete_many(&self, _c: &str, _e: Duration, _n: Option<usize>) {
            self.ok("delete_many");
        }
        fn on_delete_many_failed(&self, _c: &str, vm: bool) {
            self.failed("delete_many", vm);
        }
    }

    /// Records manager callbacks as `action` / `action_failed` and
    /// `retry:action:N`.
    #[derive(Debug, Default)]
    pub struct RecordingManagerObserver {
        events: Mutex<Vec<String>>,
    }

    impl RecordingManagerObserver {
        pub fn events(&self) -> Vec<String> {
            snapshot(&self.events)
        }

        pub fn count(&self, event: &str) -> usize {
            self.events().iter().filter(|e| *e == event).count()
        }

        pub fn retries(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| e.starts_with("retry:"))
                .count()
        }
    }

    impl ManagerObserver for RecordingManagerObserver {
        fn on_action(&self, action: &str, _elapsed: Duration, ok: bool) {
            let event = if ok {
                action.to_string()
            } else {
                format!("{action}_failed")
            };
            push(&self.events, event);
        }

        fn on_retry(&self, action: &str, attempt: u32) {
            push(&self.events, format!("retry:{action}:{attempt}"));
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cachet types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// Small id pool so generated specs and records overlap.
    pub const WIDGET_IDS: [&str; 8] = ["w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7"];

    pub const COLORS: [&str; 3] = ["red", "green", "blue"];

    pub fn arb_widget_id() -> impl Strategy<Value = String> {
        prop::sample::select(WIDGET_IDS.to_vec()).prop_map(String::from)
    }

    pub fn arb_color() -> impl Strategy<Value = String> {
        prop::sample::select(COLORS.to_vec()).prop_map(String::from)
    }

    pub fn arb_widget() -> impl Strategy<Value = Widget> {
        (arb_widget_id(), arb_color(), 0i64..100, 1i64..5).prop_map(
            |(id, color, weight, version)| {
                Widget::new(id, color)
                    .with_weight(weight)
                    .with_version(version)
            },
        )
    }

    /// Widgets with distinct ids.
    pub fn arb_widgets(max: usize) -> impl Strategy<Value = Vec<Widget>> {
        prop::collection::btree_map(arb_widget_id(), (arb_color(), 0i64..100), 0..=max).prop_map(
            |entries| {
                entries
                    .into_iter()
                    .map(|(id, (color, weight))| Widget::new(id, color).with_weight(weight))
                    .collect()
            },
        )
    }

    pub fn arb_cache_tag() -> impl Strategy<Value = CacheTag> {
        prop_oneof![
            arb_color().prop_map(|c| CacheTag::new("color", [c])),
            (0u8..4).prop_map(|n| CacheTag::new("bucket", [n])),
        ]
    }

    /// Cache settings with capacity eviction on and age eviction on or off.
    pub fn arb_cache_settings() -> impl Strategy<Value = CacheSettings> {
        (1i64..64, -1i64..60).prop_map(|(capacity, minutes)| {
            CacheSettings::default()
                .with_max_capacity(capacity)
                .with_expiration_timeout_minutes(minutes)
        })
    }

    /// Specification trees over [`Widget`] fields and ids.
    pub fn arb_specification() -> impl Strategy<Value = Specification<String>> {
        let leaf = prop_oneof![
            Just(Specification::All),
            prop::collection::vec(arb_widget_id(), 0..4).prop_map(Specification::ManyIds),
            arb_color().prop_map(|c| Specification::field(FilterExpr::eq("color", json!(c)))),
            (0i64..100).prop_map(|w| Specification::field(FilterExpr::gt("weight", json!(w)))),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Specification::And),
                prop::collection::vec(inner.clone(), 0..4).prop_map(Specification::Or),
                inner.prop_map(Specification::negate),
            ]
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made stores and repositories.

    use super::*;

    pub fn widget(id: &str, version: i64) -> Widget {
        Widget::new(id, "red").with_version(version)
    }

    pub fn color_tag(color: &str) -> CacheTag {
        CacheTag::new("color", [color])
    }

    pub fn widget_store() -> Arc<MemoryStore<Widget>> {
        Arc::new(MemoryStore::new("widgets"))
    }

    pub fn instrumented_store() -> Arc<InstrumentedStore<Widget>> {
        Arc::new(InstrumentedStore::memory("widgets"))
    }

    /// Repository over `store` that tags every widget by color.
    pub fn widget_repository<S>(store: Arc<S>) -> CachedRepository<Widget, S>
    where
        S: BackingStore<Widget>,
    {
        CachedRepository::builder(store)
            .tagger(|w: &Widget| vec![color_tag(&w.color)])
            .build()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cachet-specific errors.

    use super::*;
    use std::fmt::Debug;

    #[track_caller]
    pub fn assert_ok<T: Debug>(result: &CachetResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: Debug>(result: &CachetResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert a single-record version mismatch with the given details.
    #[track_caller]
    pub fn assert_version_mismatch<T: Debug>(
        result: &CachetResult<T>,
        id: &str,
        current: i64,
        attempted: i64,
    ) {
        match result {
            Err(CachetError::Concurrency(ConcurrencyError::VersionMismatch {
                id: Some(got_id),
                current_version,
                update_version,
            })) => {
                assert_eq!(got_id, id, "Wrong id in VersionMismatch");
                assert_eq!(*current_version, Some(current), "Wrong current version");
                assert_eq!(*update_version, Some(attempted), "Wrong attempted version");
            }
            other => panic!("Expected VersionMismatch for {id}, got: {:?}", other),
        }
    }

    /// Assert a batch-level version mismatch that names no record.
    #[track_caller]
    pub fn assert_batch_version_mismatch<T: Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Concurrency(ConcurrencyError::VersionMismatch { id: None, .. })) => {}
            other => panic!("Expected batch VersionMismatch, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_invalid_version<T: Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Concurrency(ConcurrencyError::InvalidVersion { .. })) => {}
            other => panic!("Expected InvalidVersion, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_store_error<T: Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Store(_)) => {}
            other => panic!("Expected Store error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
