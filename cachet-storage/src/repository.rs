//! Read-through / write-through repository.
//!
//! [`CachedRepository`] puts a [`TaggedCache`] in front of a
//! [`VersionedStore`] and serializes every cache-filling or mutating path per
//! key with a [`KeyedLock`]:
//!
//! ```text
//! get(id)      cache ──hit──→ return
//!                │ miss
//!                ▼
//!              lock(id) → cache again → store → cache.add → unlock
//!
//! update(e)    lock(id) → versioned write → cache.add → changed event → unlock
//! delete(id)   lock(id) → store delete → cache.remove → unlock → deleted event
//! ```
//!
//! The second cache check under the lock keeps concurrent readers of the
//! same missing key down to one store round trip. Records that do not exist
//! are not cached.

use crate::cache::{CacheTag, TaggedCache};
use crate::store::BackingStore;
use crate::versioned::VersionedStore;
use cachet_core::{
    CacheObserver, CacheSettings, CachetResult, Clock, Entity, KeyedLock, NullCacheObserver,
    NullRepositoryObserver, RepositoryObserver, RepositorySettings, SearchOptions, SearchResult,
    Specification, SystemClock,
};
use cachet_events::ChangeNotifier;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Computes the cache tags attached to a record whenever it is cached.
pub type Tagger<R> = Arc<dyn Fn(&R) -> Vec<CacheTag> + Send + Sync>;

/// Cached, per-key serialized repository over a [`BackingStore`].
pub struct CachedRepository<R: Entity, S> {
    versioned: VersionedStore<R, S>,
    cache: TaggedCache<R::Id, R>,
    locks: KeyedLock<R::Id>,
    notifier: ChangeNotifier<R>,
    tagger: Option<Tagger<R>>,
}

impl<R: Entity, S> fmt::Debug for CachedRepository<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedRepository")
            .field("versioned", &self.versioned)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<R, S> CachedRepository<R, S>
where
    R: Entity,
    S: BackingStore<R>,
{
    /// Repository with default settings, named after the store's collection.
    pub fn new(store: Arc<S>) -> Self {
        Self::builder(store).build()
    }

    pub fn builder(store: Arc<S>) -> CachedRepositoryBuilder<R, S> {
        CachedRepositoryBuilder {
            store,
            cache_settings: CacheSettings::default(),
            repository_settings: RepositorySettings::default(),
            cache_observer: Arc::new(NullCacheObserver),
            repository_observer: Arc::new(NullRepositoryObserver),
            clock: Arc::new(SystemClock),
            notifier: None,
            tagger: None,
        }
    }

    pub fn collection_name(&self) -> &str {
        self.versioned.collection_name()
    }

    pub fn cache(&self) -> &TaggedCache<R::Id, R> {
        &self.cache
    }

    pub fn locks(&self) -> &KeyedLock<R::Id> {
        &self.locks
    }

    pub fn notifier(&self) -> &ChangeNotifier<R> {
        &self.notifier
    }

    pub fn versioned(&self) -> &VersionedStore<R, S> {
        &self.versioned
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read through the cache. Missing records return `None` and are not
    /// cached.
    pub async fn get(&self, id: &R::Id) -> CachetResult<Option<R>> {
        if let Some(hit) = self.cache.get(id) {
            return Ok(Some(hit));
        }

        let _guard = self.locks.acquire_async(id.clone()).await;
        if let Some(hit) = self.cache.peek(id) {
            debug!(collection = %self.collection_name(), id = %id, "Filled by a concurrent reader");
            return Ok(Some(hit));
        }

        let found = self.versioned.get(id).await?;
        if let Some(record) = &found {
            self.cache_record(record.clone());
        }
        Ok(found)
    }

    /// Read many records, fetching every cache miss in one store query.
    ///
    /// Duplicate ids are collapsed. Records that do not exist are left out.
    pub async fn get_many(&self, ids: &[R::Id]) -> CachetResult<Vec<R>> {
        let mut seen = HashSet::with_capacity(ids.len());
        let mut found = Vec::with_capacity(ids.len());
        let mut misses = Vec::new();

        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.cache.get(id) {
                Some(hit) => found.push(hit),
                None => misses.push(id.clone()),
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }

        let _guard = self.locks.acquire_many_async(misses.iter().cloned()).await;
        let mut to_fetch = Vec::with_capacity(misses.len());
        for id in misses {
            match self.cache.peek(&id) {
                Some(hit) => found.push(hit),
                None => to_fetch.push(id),
            }
        }

        if !to_fetch.is_empty() {
            for record in self.versioned.get_many(&to_fetch).await? {
                self.cache_record(record.clone());
                found.push(record);
            }
        }
        Ok(found)
    }

    /// Every record, straight from the store.
    pub async fn get_all(&self) -> CachetResult<Vec<R>> {
        self.versioned.get_all().await
    }

    /// Search the store. Results are not cached.
    pub async fn search(
        &self,
        spec: &Specification<R::Id>,
        options: &SearchOptions,
    ) -> CachetResult<SearchResult<R>> {
        self.versioned.search(spec, options).await
    }

    pub async fn count(
        &self,
        spec: &Specification<R::Id>,
        options: &SearchOptions,
    ) -> CachetResult<u64> {
        self.versioned.count(spec, options).await
    }

    /// Cached records carrying `tag`. Never touches the store.
    pub fn select_cached(&self, tag: &CacheTag) -> Vec<R> {
        self.cache
            .select_by_tag(tag)
            .into_iter()
            .map(|(_, record)| record)
            .collect()
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write `entity` under the optimistic protocol and cache it.
    pub async fn update(&self, entity: R) -> CachetResult<()> {
        let _guard = self.locks.acquire_async(entity.id()).await;
        self.versioned.update(&entity).await?;
        self.cache_record(entity.clone());
        self.notifier.notify_changed(&entity);
        Ok(())
    }

    /// Write a batch and cache every item. See
    /// [`VersionedStore::bulk_upsert`] for the conflict semantics.
    pub async fn bulk_upsert(&self, entities: Vec<R>) -> CachetResult<()> {
        if entities.is_empty() {
            return Ok(());
        }

        let guard = self
            .locks
            .acquire_many_async(entities.iter().map(|e| e.id()))
            .await;
        if let Err(e) = self.versioned.bulk_upsert(&entities).await {
            // Part of the batch may have committed; cached copies can't be trusted.
            for entity in &entities {
                self.cache.remove(&entity.id());
            }
            return Err(e);
        }
        for entity in &entities {
            self.cache_record(entity.clone());
        }
        drop(guard);

        for entity in &entities {
            self.notifier.notify_changed(entity);
        }
        Ok(())
    }

    /// Remove a record. Returns the removed record, if there was one.
    pub async fn delete(&self, id: &R::Id) -> CachetResult<Option<R>> {
        let guard = self.locks.acquire_async(id.clone()).await;
        let removed = self.versioned.delete(id).await?;
        self.cache.remove(id);
        drop(guard);

        if let Some(record) = &removed {
            self.notifier.notify_deleted(record);
        }
        Ok(removed)
    }

    /// Remove every listed record. Returns the records that existed.
    pub async fn delete_many(&self, ids: &[R::Id]) -> CachetResult<Vec<R>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let guard = self.locks.acquire_many_async(ids.iter().cloned()).await;
        let existing = self.versioned.get_many(ids).await?;
        self.versioned.delete_many(ids).await?;
        for id in ids {
            self.cache.remove(id);
        }
        drop(guard);

        for record in &existing {
            self.notifier.notify_deleted(record);
        }
        Ok(existing)
    }

    /// Remove every record satisfying `spec`. Returns the removed records.
    ///
    /// Matches are resolved first, then locked and re-checked, so a record
    /// that stopped matching in between is left alone.
    pub async fn delete_matching(&self, spec: &Specification<R::Id>) -> CachetResult<Vec<R>> {
        let candidates = self
            .versioned
            .search(spec, &SearchOptions::unlimited())
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<R::Id> = candidates.items.iter().map(|r| r.id()).collect();
        let guard = self.locks.acquire_many_async(ids.iter().cloned()).await;

        let scoped = spec.clone().and(Specification::ManyIds(ids));
        let confirmed = self
            .versioned
            .search(&scoped, &SearchOptions::unlimited())
            .await?
            .items;
        self.versioned.delete_matching(&scoped).await?;
        for record in &confirmed {
            self.cache.remove(&record.id());
        }
        drop(guard);

        for record in &confirmed {
            self.notifier.notify_deleted(record);
        }
        Ok(confirmed)
    }

    // ========================================================================
    // CACHE CONTROL
    // ========================================================================

    /// Drop one record from the cache. The store is untouched.
    pub fn invalidate(&self, id: &R::Id) -> bool {
        self.cache.remove(id).is_some()
    }

    /// Drop every cached record carrying `tag`.
    pub fn invalidate_tag(&self, tag: &CacheTag) -> usize {
        self.cache.remove_by_tag(tag)
    }

    fn cache_record(&self, record: R) {
        let tags = match &self.tagger {
            Some(tagger) => tagger(&record),
            None => Vec::new(),
        };
        self.cache.add(record.id(), record, tags);
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`CachedRepository`].
pub struct CachedRepositoryBuilder<R: Entity, S> {
    store: Arc<S>,
    cache_settings: CacheSettings,
    repository_settings: RepositorySettings,
    cache_observer: Arc<dyn CacheObserver>,
    repository_observer: Arc<dyn RepositoryObserver>,
    clock: Arc<dyn Clock>,
    notifier: Option<ChangeNotifier<R>>,
    tagger: Option<Tagger<R>>,
}

impl<R, S> CachedRepositoryBuilder<R, S>
where
    R: Entity,
    S: BackingStore<R>,
{
    pub fn cache_settings(mut self, settings: CacheSettings) -> Self {
        self.cache_settings = settings;
        self
    }

    pub fn repository_settings(mut self, settings: RepositorySettings) -> Self {
        self.repository_settings = settings;
        self
    }

    pub fn cache_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.cache_observer = observer;
        self
    }

    pub fn repository_observer(mut self, observer: Arc<dyn RepositoryObserver>) -> Self {
        self.repository_observer = observer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a notifier with other components instead of creating one.
    pub fn notifier(mut self, notifier: ChangeNotifier<R>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn tagger(mut self, tagger: impl Fn(&R) -> Vec<CacheTag> + Send + Sync + 'static) -> Self {
        self.tagger = Some(Arc::new(tagger));
        self
    }

    pub fn build(self) -> CachedRepository<R, S> {
        let name = self.store.collection_name().to_string();
        let cache = TaggedCache::builder(name)
            .settings(self.cache_settings)
            .clock(self.clock)
            .observer(self.cache_observer)
            .build();
        let versioned = VersionedStore::new(self.store)
            .with_settings(self.repository_settings)
            .with_observer(self.repository_observer);

        CachedRepository {
            versioned,
            cache,
            locks: KeyedLock::new(),
            notifier: self.notifier.unwrap_or_default(),
            tagger: self.tagger,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
