//! Tagged LRU/TTL cache.
//!
//! One mutex per cache instance guards the primary index and the tag index,
//! so every operation is atomic. Entries slide their expiration on every
//! read. Two eviction triggers exist:
//!
//! - capacity: synchronous, inside the insert that pushed the cache over
//!   `max_capacity`; removes the oldest quarter (at least enough to get back
//!   under the cap)
//! - age: at most once per `cleanup_interval`, an insert dispatches a sweep to
//!   a background thread that removes entries idle longer than
//!   `expiration_timeout_minutes`
//!
//! Observer callbacks run while the cache mutex is held and must not call
//! back into the cache. Item-removed subscribers run after it is released
//! and may.

use super::tag::CacheTag;
use cachet_core::observer::notify;
use cachet_core::{CacheObserver, CacheSettings, Clock, NullCacheObserver, SystemClock, Timestamp};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, error};

/// Callback fired for every entry removed from the cache.
pub type RemovedSubscriber<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

/// Snapshot of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<K, V> {
    pub key: K,
    pub value: V,
    pub tags: Vec<CacheTag>,
    pub last_accessed: Timestamp,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<K, V>>,
    /// Per-tag chains. The most recently linked key is last.
    tags: HashMap<CacheTag, Vec<K>>,
    last_cleanup: Timestamp,
}

/// Entries removed by an operation, reported once the mutex is released.
type Removed<K, V> = Vec<(K, V)>;

struct Shared<K, V> {
    name: String,
    settings: CacheSettings,
    cleanup_interval: chrono::Duration,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn CacheObserver>,
    state: Mutex<CacheState<K, V>>,
    subscribers: RwLock<Vec<RemovedSubscriber<K, V>>>,
}

impl<K, V> Shared<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self, what: &str, f: impl FnOnce(&dyn CacheObserver, &str)) {
        notify(what, || f(self.observer.as_ref(), &self.name));
    }

    fn touch(&self, entry: &mut CacheEntry<K, V>, now: Timestamp) {
        entry.last_accessed = now;
        self.observe("on_touch", |o, name| o.on_touch(name));
    }

    fn report_len(&self, state: &CacheState<K, V>) {
        let count = state.entries.len();
        self.observe("keys_count", |o, name| o.keys_count(name, count));
    }

    /// Detach an entry from both indexes without reporting it.
    fn take(&self, state: &mut CacheState<K, V>, key: &K) -> Option<CacheEntry<K, V>> {
        let entry = state.entries.remove(key)?;
        for tag in &entry.tags {
            let drained = match state.tags.get_mut(tag) {
                Some(chain) => {
                    if let Some(pos) = chain.iter().position(|k| k == key) {
                        chain.remove(pos);
                    }
                    chain.is_empty()
                }
                None => false,
            };
            if drained {
                state.tags.remove(tag);
            }
        }
        Some(entry)
    }

    fn remove_reported(
        &self,
        state: &mut CacheState<K, V>,
        key: &K,
        removed: &mut Removed<K, V>,
    ) -> bool {
        match self.take(state, key) {
            Some(entry) => {
                removed.push((entry.key, entry.value));
                self.report_len(state);
                self.observe("on_remove", |o, name| o.on_remove(name));
                true
            }
            None => false,
        }
    }

    /// Upsert an entry. `keep_timestamp` preserves a prior access time instead
    /// of touching. Returns whether an age sweep is due.
    fn insert(
        &self,
        state: &mut CacheState<K, V>,
        key: K,
        value: V,
        tags: Vec<CacheTag>,
        keep_timestamp: Option<Timestamp>,
        removed: &mut Removed<K, V>,
    ) -> bool {
        let now = self.clock.now();
        let replaced = self.take(state, &key).is_some();

        let last_accessed = match keep_timestamp {
            Some(ts) => ts,
            None => {
                self.observe("on_touch", |o, name| o.on_touch(name));
                now
            }
        };

        let mut unique_tags: Vec<CacheTag> = Vec::with_capacity(tags.len());
        for tag in tags {
            if !unique_tags.contains(&tag) {
                unique_tags.push(tag);
            }
        }
        for tag in &unique_tags {
            state.tags.entry(tag.clone()).or_default().push(key.clone());
        }
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                tags: unique_tags,
                last_accessed,
            },
        );

        if self.settings.capacity_eviction_enabled()
            && state.entries.len() > self.settings.max_capacity as usize
        {
            self.evict_by_capacity(state, removed);
        }

        self.report_len(state);
        if replaced {
            self.observe("on_update", |o, name| o.on_update(name));
        } else {
            self.observe("on_add", |o, name| o.on_add(name));
        }

        let sweep_due = now - state.last_cleanup >= self.cleanup_interval;
        if sweep_due {
            state.last_cleanup = now;
        }
        sweep_due
    }

    fn evict_by_capacity(&self, state: &mut CacheState<K, V>, removed: &mut Removed<K, V>) {
        let capacity = self.settings.max_capacity as usize;
        let len = state.entries.len();
        let count = (capacity / 4).max(len - capacity).min(len);

        let mut by_age: Vec<(Timestamp, K)> = state
            .entries
            .values()
            .map(|e| (e.last_accessed, e.key.clone()))
            .collect();
        by_age.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, key) in by_age.into_iter().take(count) {
            self.remove_reported(state, &key, removed);
        }

        debug!(
            cache = %self.name,
            removed = count,
            remaining = state.entries.len(),
            "Cleanup by capacity complete"
        );
        self.observe("on_cleanup_by_size", |o, name| o.on_cleanup_by_size(name, count));
    }

    fn sweep_expired(&self) -> usize {
        let Some(timeout) = self.settings.expiration_timeout() else {
            return 0;
        };
        // A timeout reaching past the earliest representable time expires nothing.
        let Some(min_time) = self.clock.now().checked_sub_signed(timeout) else {
            return 0;
        };

        let mut removed = Vec::new();
        let count = {
            let mut state = self.lock();
            let stale: Vec<K> = state
                .entries
                .values()
                .filter(|e| e.last_accessed < min_time)
                .map(|e| e.key.clone())
                .collect();
            for key in &stale {
                self.remove_reported(&mut state, key, &mut removed);
            }
            debug!(
                cache = %self.name,
                removed = stale.len(),
                remaining = state.entries.len(),
                "Cleanup by time complete"
            );
            let count = stale.len();
            self.observe("on_cleanup_by_time", |o, name| o.on_cleanup_by_time(name, count));
            count
        };

        self.fire_removed(removed);
        count
    }

    fn fire_removed(&self, removed: Removed<K, V>) {
        if removed.is_empty() {
            return;
        }
        let subscribers: Vec<_> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (key, value) in &removed {
            for subscriber in &subscribers {
                notify("item_removed", || subscriber(key, value));
            }
        }
    }
}

// ============================================================================
// TAGGED CACHE
// ============================================================================

/// Bounded key/value cache with a secondary tag index.
///
/// Clones share the same entries.
pub struct TaggedCache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for TaggedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> fmt::Debug for TaggedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedCache")
            .field("name", &self.shared.name)
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

impl<K, V> TaggedCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, settings: CacheSettings) -> Self {
        Self::builder(name).settings(settings).build()
    }

    pub fn builder(name: impl Into<String>) -> TaggedCacheBuilder<K, V> {
        TaggedCacheBuilder {
            name: name.into(),
            settings: CacheSettings::default(),
            clock: Arc::new(SystemClock),
            observer: Arc::new(NullCacheObserver),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.shared.settings
    }

    /// Look up a value, sliding its expiration on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let hit = {
            let mut state = self.shared.lock();
            let now = self.shared.clock.now();
            match state.entries.get_mut(key) {
                Some(entry) => {
                    self.shared.touch(entry, now);
                    Some(entry.value.clone())
                }
                None => None,
            }
        };
        let missed = hit.is_none();
        self.shared.observe("on_get", |o, name| o.on_get(name, missed));
        hit
    }

    /// Look up a value without touching it or reporting to the observer.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.shared.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Return the cached value or build, cache and return a new one.
    ///
    /// The factory runs while the cache mutex is held, so it serializes with
    /// every other operation on this cache and must not call back into it.
    /// It may push tags for the new entry.
    pub fn get_or_create<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce(&K, &mut Vec<CacheTag>) -> V,
    {
        match self.try_get_or_create(key, |k, tags| Ok::<V, Infallible>(factory(k, tags))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible [`get_or_create`](Self::get_or_create). Nothing is cached
    /// when the factory fails.
    pub fn try_get_or_create<F, E>(&self, key: K, factory: F) -> Result<V, E>
    where
        F: FnOnce(&K, &mut Vec<CacheTag>) -> Result<V, E>,
    {
        let mut removed = Vec::new();
        let (value, sweep_due) = {
            let mut state = self.shared.lock();
            let now = self.shared.clock.now();
            if let Some(entry) = state.entries.get_mut(&key) {
                self.shared.touch(entry, now);
                let value = entry.value.clone();
                drop(state);
                self.shared.observe("on_get", |o, name| o.on_get(name, false));
                return Ok(value);
            }

            let mut tags = Vec::new();
            let value = factory(&key, &mut tags)?;
            let sweep_due =
                self.shared
                    .insert(&mut state, key, value.clone(), tags, None, &mut removed);
            (value, sweep_due)
        };
        self.shared.observe("on_get", |o, name| o.on_get(name, true));
        self.after_write(removed, sweep_due);
        Ok(value)
    }

    /// Insert or replace unconditionally, with a fresh access time.
    pub fn add(&self, key: K, value: V, tags: impl IntoIterator<Item = CacheTag>) {
        let mut removed = Vec::new();
        let sweep_due = {
            let mut state = self.shared.lock();
            self.shared.insert(
                &mut state,
                key,
                value,
                tags.into_iter().collect(),
                None,
                &mut removed,
            )
        };
        self.after_write(removed, sweep_due);
    }

    /// Replace an existing entry and refresh its access time. No-op when
    /// the key is absent.
    pub fn update(&self, key: K, value: V, tags: impl IntoIterator<Item = CacheTag>) -> bool {
        self.replace_existing(key, value, tags, true, |_, _| true)
    }

    /// Replace an existing entry's value, keeping its access time. No-op
    /// when the key is absent.
    pub fn update_value(&self, key: K, value: V, tags: impl IntoIterator<Item = CacheTag>) -> bool {
        self.replace_existing(key, value, tags, false, |_, _| true)
    }

    /// [`update_value`](Self::update_value), skipped when
    /// `predicate(old, new)` is false.
    pub fn update_value_if<P>(
        &self,
        key: K,
        value: V,
        predicate: P,
        tags: impl IntoIterator<Item = CacheTag>,
    ) -> bool
    where
        P: FnOnce(&V, &V) -> bool,
    {
        self.replace_existing(key, value, tags, false, predicate)
    }

    fn replace_existing<P>(
        &self,
        key: K,
        value: V,
        tags: impl IntoIterator<Item = CacheTag>,
        touch: bool,
        predicate: P,
    ) -> bool
    where
        P: FnOnce(&V, &V) -> bool,
    {
        let mut removed = Vec::new();
        let sweep_due = {
            let mut state = self.shared.lock();
            let previous = match state.entries.get(&key) {
                Some(entry) => entry,
                None => return false,
            };
            if !predicate(&previous.value, &value) {
                return false;
            }
            let keep = if touch {
                None
            } else {
                Some(previous.last_accessed)
            };
            self.shared.insert(
                &mut state,
                key,
                value,
                tags.into_iter().collect(),
                keep,
                &mut removed,
            )
        };
        self.after_write(removed, sweep_due);
        true
    }

    /// Remove an entry and its tag links.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut removed = Vec::new();
        {
            let mut state = self.shared.lock();
            self.shared.remove_reported(&mut state, key, &mut removed);
        }
        let value = removed.first().map(|(_, v)| v.clone());
        self.shared.fire_removed(removed);
        value
    }

    /// Entries carrying `tag`, most recently tagged first. Touches each.
    pub fn select_by_tag(&self, tag: &CacheTag) -> Vec<(K, V)> {
        let mut state = self.shared.lock();
        let now = self.shared.clock.now();
        let keys: Vec<K> = match state.tags.get(tag) {
            Some(chain) => chain.iter().rev().cloned().collect(),
            None => return Vec::new(),
        };
        let mut selected = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = state.entries.get_mut(&key) {
                self.shared.touch(entry, now);
                selected.push((key, entry.value.clone()));
            }
        }
        selected
    }

    /// Remove every entry carrying `tag`. Returns how many were removed.
    pub fn remove_by_tag(&self, tag: &CacheTag) -> usize {
        let mut removed = Vec::new();
        {
            let mut state = self.shared.lock();
            let keys: Vec<K> = state.tags.get(tag).cloned().unwrap_or_default();
            for key in &keys {
                self.shared.remove_reported(&mut state, key, &mut removed);
            }
        }
        let count = removed.len();
        self.shared.fire_removed(removed);
        count
    }

    /// Empty both indexes at once. Subscribers are not notified.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        state.entries.clear();
        state.tags.clear();
        self.shared.report_len(&state);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shared.lock().entries.contains_key(key)
    }

    /// Copy of the current keys.
    pub fn keys(&self) -> Vec<K> {
        self.shared.lock().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct tags with at least one live entry.
    pub fn tag_count(&self) -> usize {
        self.shared.lock().tags.len()
    }

    pub fn tags_of(&self, key: &K) -> Option<Vec<CacheTag>> {
        self.shared.lock().entries.get(key).map(|e| e.tags.clone())
    }

    pub fn entry(&self, key: &K) -> Option<CacheEntry<K, V>> {
        self.shared.lock().entries.get(key).cloned()
    }

    /// Register a callback for every removed entry.
    pub fn subscribe_removed(&self, subscriber: impl Fn(&K, &V) + Send + Sync + 'static) {
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(subscriber));
    }

    /// Run the age sweep now, on the calling thread. Returns how many
    /// entries expired.
    pub fn cleanup_expired(&self) -> usize {
        self.shared.sweep_expired()
    }

    fn after_write(&self, removed: Removed<K, V>, sweep_due: bool) {
        self.shared.fire_removed(removed);
        if sweep_due && self.shared.settings.age_eviction_enabled() {
            self.schedule_sweep();
        }
    }

    fn schedule_sweep(&self) {
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("cachet-sweep-{}", self.shared.name))
            .spawn(move || {
                shared.sweep_expired();
            });
        if let Err(e) = spawned {
            error!(cache = %self.shared.name, error = %e, "Failed to start cleanup by time");
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`TaggedCache`].
pub struct TaggedCacheBuilder<K, V> {
    name: String,
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn CacheObserver>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> TaggedCacheBuilder<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> TaggedCache<K, V> {
        let now = self.clock.now();
        let cleanup_interval =
            chrono::Duration::from_std(self.settings.cleanup_interval).unwrap_or(chrono::Duration::MAX);
        TaggedCache {
            shared: Arc::new(Shared {
                name: self.name,
                settings: self.settings,
                cleanup_interval,
                clock: self.clock,
                observer: self.observer,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    tags: HashMap::new(),
                    last_cleanup: now,
                }),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
