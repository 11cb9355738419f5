//! Optimistic-versioned store adapter.
//!
//! Turns a plain [`BackingStore`] into one that enforces the version
//! protocol:
//!
//! - version `1` creates: the insert fails if the id already exists
//! - version `v > 1` updates: the replace only applies if the stored record
//!   is at `v - 1`
//!
//! A write that loses the race surfaces as
//! `ConcurrencyError::VersionMismatch`. The adapter does no locking of its
//! own; callers that need per-key serialization hold a [`KeyedLock`] guard
//! around it.
//!
//! [`KeyedLock`]: cachet_core::KeyedLock

use crate::store::{to_store_filter, BackingStore, StoreFilter, WriteOp};
use cachet_core::observer::notify;
use cachet_core::{
    CachetError, CachetResult, ConcurrencyError, Entity, NullRepositoryObserver,
    RepositoryObserver, RepositorySettings, SearchOptions, SearchResult, Specification,
    StoreError, TimeGuard, INITIAL_DATA_VERSION,
};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a single write stands in the optimistic protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Version 1: the record must not exist yet.
    Creating,
    /// Version above 1: the stored record must be one version behind.
    Updating,
    /// The precondition failed.
    Conflict,
    Committed,
}

impl WriteState {
    /// Initial state for a write at `version`.
    pub fn classify(version: i64) -> CachetResult<WriteState> {
        match version {
            v if v < INITIAL_DATA_VERSION => {
                Err(ConcurrencyError::InvalidVersion { version: v }.into())
            }
            INITIAL_DATA_VERSION => Ok(WriteState::Creating),
            _ => Ok(WriteState::Updating),
        }
    }
}

/// Operations reported to the [`RepositoryObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Get,
    GetMany,
    GetAll,
    Search,
    Count,
    Create,
    Update,
    BulkUpdate,
    Delete,
    DeleteMany,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Get => "get",
            Op::GetMany => "get_many",
            Op::GetAll => "get_all",
            Op::Search => "search",
            Op::Count => "count",
            Op::Create => "create",
            Op::Update => "update",
            Op::BulkUpdate => "bulk_update",
            Op::Delete => "delete",
            Op::DeleteMany => "delete_many",
        }
    }
}

/// Version-checking adapter over a [`BackingStore`].
pub struct VersionedStore<R, S> {
    store: Arc<S>,
    settings: RepositorySettings,
    observer: Arc<dyn RepositoryObserver>,
    _marker: PhantomData<fn() -> R>,
}

impl<R, S> Clone for VersionedStore<R, S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            settings: self.settings.clone(),
            observer: Arc::clone(&self.observer),
            _marker: PhantomData,
        }
    }
}

impl<R, S> fmt::Debug for VersionedStore<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedStore")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<R, S> VersionedStore<R, S>
where
    R: Entity,
    S: BackingStore<R>,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            settings: RepositorySettings::default(),
            observer: Arc::new(NullRepositoryObserver),
            _marker: PhantomData,
        }
    }

    pub fn with_settings(mut self, settings: RepositorySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RepositoryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    pub fn collection_name(&self) -> &str {
        self.store.collection_name()
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Persist `entity` under the optimistic protocol.
    pub async fn update(&self, entity: &R) -> CachetResult<()> {
        let id = entity.id();
        let version = entity.data_version();

        if self.settings.disable_optimistic_lock {
            let guard = self.time_guard(Op::Update);
            let result = self.store.upsert(entity).await;
            self.report(Op::Update, &guard, &result, |_| None);
            return result;
        }

        let state = match WriteState::classify(version) {
            Ok(state) => state,
            Err(e) => {
                let result: CachetResult<()> = Err(e);
                self.report(Op::Update, &self.time_guard(Op::Update), &result, |_| None);
                return result;
            }
        };

        let op = if state == WriteState::Creating {
            Op::Create
        } else {
            Op::Update
        };
        let guard = self.time_guard(op);

        let result = match state {
            WriteState::Creating => match self.store.insert(entity).await {
                Err(CachetError::Store(StoreError::DuplicateKey { .. })) => {
                    Err(self.conflict(&id, version).await)
                }
                other => other,
            },
            _ => {
                let filter = StoreFilter::id_and_version(id.clone(), version - 1);
                match self.store.conditional_replace(&filter, entity).await {
                    Ok(0) => Err(self.conflict(&id, version).await),
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        };

        let outcome = if result.is_ok() {
            WriteState::Committed
        } else {
            WriteState::Conflict
        };
        debug!(
            collection = %self.collection_name(),
            id = %id,
            version,
            from = ?state,
            to = ?outcome,
            "Versioned write finished"
        );
        self.report(op, &guard, &result, |_| None);
        result
    }

    /// Write a batch as one unordered bulk operation.
    ///
    /// Conflict detection is batch-level: when any item loses its race the
    /// whole call fails with a `VersionMismatch` that names no item, even
    /// though the other items may have been written.
    pub async fn bulk_upsert(&self, entities: &[R]) -> CachetResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let guard = self.time_guard(Op::BulkUpdate);
        let result = self.bulk_upsert_inner(entities).await;
        self.report(Op::BulkUpdate, &guard, &result, |_| Some(entities.len()));
        result
    }

    async fn bulk_upsert_inner(&self, entities: &[R]) -> CachetResult<()> {
        let mut ops = Vec::with_capacity(entities.len());
        let mut creating = 0u64;
        let mut updating = 0u64;

        for entity in entities {
            if self.settings.disable_optimistic_lock {
                ops.push(WriteOp::Upsert(entity.clone()));
                continue;
            }
            let version = entity.data_version();
            match WriteState::classify(version)? {
                WriteState::Creating => {
                    creating += 1;
                    ops.push(WriteOp::Insert(entity.clone()));
                }
                _ => {
                    updating += 1;
                    ops.push(WriteOp::ReplaceOne {
                        filter: StoreFilter::id_and_version(entity.id(), version - 1),
                        record: entity.clone(),
                    });
                }
            }
        }

        let outcome = self.store.bulk_write(ops, false).await?;

        if let Some(error) = outcome.first_other_error() {
            return Err(StoreError::WriteFailed {
                collection: self.collection_name().to_string(),
                reason: format!("operation {}: {}", error.index, error.message),
            }
            .into());
        }
        if self.settings.disable_optimistic_lock {
            return Ok(());
        }
        if outcome.has_duplicate_key()
            || outcome.inserted_count != creating
            || outcome.modified_count != updating
        {
            warn!(
                collection = %self.collection_name(),
                creating,
                inserted = outcome.inserted_count,
                updating,
                modified = outcome.modified_count,
                "Bulk write lost a version race"
            );
            return Err(ConcurrencyError::batch_version_mismatch().into());
        }
        Ok(())
    }

    /// Remove a record unconditionally.
    pub async fn delete(&self, id: &R::Id) -> CachetResult<Option<R>> {
        let guard = self.time_guard(Op::Delete);
        let result = self.store.delete(id).await;
        self.report(Op::Delete, &guard, &result, |_| None);
        result
    }

    /// Remove every listed record. Returns how many existed.
    pub async fn delete_many(&self, ids: &[R::Id]) -> CachetResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let guard = self.time_guard(Op::DeleteMany);
        let result = self.store.delete_many(&StoreFilter::IdIn(ids.to_vec())).await;
        self.report(Op::DeleteMany, &guard, &result, |n| Some(*n as usize));
        result
    }

    /// Remove every record satisfying `spec`.
    pub async fn delete_matching(&self, spec: &Specification<R::Id>) -> CachetResult<u64> {
        let guard = self.time_guard(Op::DeleteMany);
        let result = match spec.validate() {
            Ok(()) => self.store.delete_many(&to_store_filter(spec)).await,
            Err(e) => Err(e),
        };
        self.report(Op::DeleteMany, &guard, &result, |n| Some(*n as usize));
        result
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn get(&self, id: &R::Id) -> CachetResult<Option<R>> {
        let guard = self.time_guard(Op::Get);
        let result = self.store.find_by_key(id).await;
        self.report(Op::Get, &guard, &result, |_| None);
        result
    }

    /// Fetch every listed record that exists, in one query.
    pub async fn get_many(&self, ids: &[R::Id]) -> CachetResult<Vec<R>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let guard = self.time_guard(Op::GetMany);
        let result = self
            .store
            .query(&StoreFilter::IdIn(ids.to_vec()), None)
            .await
            .map(|page| page.items);
        self.report(Op::GetMany, &guard, &result, |items| Some(items.len()));
        result
    }

    pub async fn get_all(&self) -> CachetResult<Vec<R>> {
        let guard = self.time_guard(Op::GetAll);
        let result = self
            .store
            .query(&StoreFilter::All, None)
            .await
            .map(|page| page.items);
        self.report(Op::GetAll, &guard, &result, |items| Some(items.len()));
        result
    }

    pub async fn search(
        &self,
        spec: &Specification<R::Id>,
        options: &SearchOptions,
    ) -> CachetResult<SearchResult<R>> {
        let guard = self.time_guard(Op::Search);
        let result = match options.validate().and_then(|()| spec.validate()) {
            Ok(()) => self.store.query(&to_store_filter(spec), options.limit).await,
            Err(e) => Err(e),
        };
        self.report(Op::Search, &guard, &result, |page| Some(page.len()));
        result
    }

    pub async fn count(
        &self,
        spec: &Specification<R::Id>,
        options: &SearchOptions,
    ) -> CachetResult<u64> {
        let guard = self.time_guard(Op::Count);
        let result = match options.validate().and_then(|()| spec.validate()) {
            Ok(()) => self.store.count(&to_store_filter(spec), options.limit).await,
            Err(e) => Err(e),
        };
        self.report(Op::Count, &guard, &result, |_| None);
        result
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Build the mismatch error for a lost race, reporting the version that
    /// is stored now (`-1` when the record is gone).
    async fn conflict(&self, id: &R::Id, attempted: i64) -> CachetError {
        let current = match self.store.find_by_key(id).await {
            Ok(Some(stored)) => stored.data_version(),
            Ok(None) => -1,
            Err(e) => {
                warn!(
                    collection = %self.collection_name(),
                    id = %id,
                    error = %e,
                    "Failed to read current version after conflict"
                );
                -1
            }
        };
        debug!(
            collection = %self.collection_name(),
            id = %id,
            current,
            attempted,
            "Version mismatch"
        );
        ConcurrencyError::version_mismatch(id.to_string(), Some(current), Some(attempted)).into()
    }

    fn time_guard(&self, op: Op) -> TimeGuard {
        TimeGuard::new(
            format!("{}.{}", self.collection_name(), op.name()),
            self.settings.slow_operation_threshold,
        )
    }

    fn report<T>(
        &self,
        op: Op,
        guard: &TimeGuard,
        result: &CachetResult<T>,
        count: impl FnOnce(&T) -> Option<usize>,
    ) {
        let collection = self.collection_name();
        let observer = self.observer.as_ref();
        match result {
            Ok(value) => {
                let elapsed = guard.elapsed();
                let count = count(value);
                notify(op.name(), || report_success(observer, op, collection, elapsed, count));
            }
            Err(e) => {
                let is_vm = e.is_version_mismatch();
                debug!(collection = %collection, op = op.name(), error = %e, "Repository operation failed");
                notify(op.name(), || report_failure(observer, op, collection, is_vm));
            }
        }
    }
}

fn report_success(
    observer: &dyn RepositoryObserver,
    op: Op,
    collection: &str,
    elapsed: Duration,
    count: Option<usize>,
) {
    match op {
        Op::Get => observer.on_get(collection, elapsed),
        Op::GetMany => observer.on_get_many(collection, elapsed, count),
        Op::GetAll => observer.on_get_all(collection, elapsed, count),
        Op::Search => observer.on_search(collection, elapsed, count),
        Op::Count => observer.on_count(collection, elapsed),
        Op::Create => observer.on_create(collection, elapsed),
        Op::Update => observer.on_update(collection, elapsed),
        Op::BulkUpdate => observer.on_bulk_update(collection, elapsed, count),
        Op::Delete => observer.on_delete(collection, elapsed),
        Op::DeleteMany => observer.on_delete_many(collection, elapsed, count),
    }
}

fn report_failure(observer: &dyn RepositoryObserver, op: Op, collection: &str, is_vm: bool) {
    match op {
        Op::Get => observer.on_get_failed(collection),
        Op::GetMany => observer.on_get_many_failed(collection),
        Op::GetAll => observer.on_get_all_failed(collection),
        Op::Search => observer.on_search_failed(collection),
        Op::Count => observer.on_count_failed(collection),
        Op::Create => observer.on_create_failed(collection, is_vm),
        Op::Update => observer.on_update_failed(collection, is_vm),
        Op::BulkUpdate => observer.on_bulk_update_failed(collection, is_vm),
        Op::Delete => observer.on_delete_failed(collection, is_vm),
        Op::DeleteMany => observer.on_delete_many_failed(collection, is_vm),
    }
}

// =============================================================================
// TESTS
// =============================================================================
