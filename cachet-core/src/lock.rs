//! Per-key mutual exclusion.
//!
//! [`KeyedLock`] serializes work that shares a key without serializing
//! unrelated keys. Each key in use owns a slot in a lock table; the slot is
//! reference counted by holders and waiters and removed as soon as the last
//! one leaves, so the table never accumulates historical keys.
//!
//! # Lifecycle
//!
//! ```text
//! checkout(key) ──→ waiting ─── lock acquired ──→ KeyGuard ─── drop ──→ checkin(key)
//!     (count+1)        │                                                 (count-1, slot removed at 0)
//!                      └── cancelled / timed out ──→ checkin(key)
//! ```
//!
//! Guards are not re-entrant: acquiring a key already held by the same task
//! waits forever.

use crate::{CachetResult, ConcurrencyError};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

// ============================================================================
// LOCK TABLE
// ============================================================================

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    /// Holders plus waiters.
    refs: usize,
}

struct LockTable<K> {
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K: Eq + Hash> LockTable<K> {
    fn checkout(&self, key: &K) -> Arc<AsyncMutex<()>>
    where
        K: Clone,
    {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            mutex: Arc::new(AsyncMutex::new(())),
            refs: 0,
        });
        slot.refs += 1;
        Arc::clone(&slot.mutex)
    }

    fn checkin(&self, key: &K) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let drained = match slots.get_mut(key) {
            Some(slot) => {
                slot.refs -= 1;
                slot.refs == 0
            }
            None => false,
        };
        if drained {
            slots.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

// ============================================================================
// CHECKOUT AND GUARDS
// ============================================================================

/// One reference on a key's slot; gives it back on drop.
struct Checkout<K: Eq + Hash> {
    table: Arc<LockTable<K>>,
    key: K,
}

impl<K: Eq + Hash> Drop for Checkout<K> {
    fn drop(&mut self) {
        self.table.checkin(&self.key);
    }
}

/// Exclusive access to one key. Released on drop.
pub struct KeyGuard<K: Eq + Hash> {
    // Field order matters: the mutex is released before the slot is checked in.
    _permit: OwnedMutexGuard<()>,
    checkout: Checkout<K>,
}

impl<K: Eq + Hash> KeyGuard<K> {
    pub fn key(&self) -> &K {
        &self.checkout.key
    }
}

impl<K: Eq + Hash + Debug> Debug for KeyGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", self.key()).finish()
    }
}

/// Exclusive access to a set of keys, acquired in sorted order.
pub struct MultiKeyGuard<K: Eq + Hash> {
    guards: Vec<KeyGuard<K>>,
}

impl<K: Eq + Hash> MultiKeyGuard<K> {
    /// Held keys in acquisition (ascending) order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.guards.iter().map(KeyGuard::key)
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl<K: Eq + Hash + Debug> Debug for MultiKeyGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

// ============================================================================
// KEYED LOCK
// ============================================================================

/// Process-wide per-key lock. Clones share the same table.
pub struct KeyedLock<K> {
    table: Arc<LockTable<K>>,
}

impl<K> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<K: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(LockTable {
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn checkout(&self, key: K) -> (Arc<AsyncMutex<()>>, Checkout<K>) {
        let mutex = self.table.checkout(&key);
        let checkout = Checkout {
            table: Arc::clone(&self.table),
            key,
        };
        (mutex, checkout)
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Cancel-safe: dropping the future before it completes gives the slot
    /// reference back.
    pub async fn acquire_async(&self, key: K) -> KeyGuard<K> {
        let (mutex, checkout) = self.checkout(key);
        let permit = mutex.lock_owned().await;
        tracing::trace!(key = ?checkout.key, "Key lock acquired");
        KeyGuard {
            _permit: permit,
            checkout,
        }
    }

    /// Like [`acquire_async`](Self::acquire_async) but gives up after `timeout`.
    pub async fn acquire_async_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> CachetResult<KeyGuard<K>> {
        let (mutex, checkout) = self.checkout(key);
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(permit) => Ok(KeyGuard {
                _permit: permit,
                checkout,
            }),
            Err(_) => {
                tracing::debug!(key = ?checkout.key, ?timeout, "Key lock acquisition timed out");
                Err(ConcurrencyError::LockAcquisitionFailed {
                    key: format!("{:?}", checkout.key),
                    reason: format!("timed out after {:?}", timeout),
                }
                .into())
            }
        }
    }

    /// Block the current thread until `key` is free.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async runtime worker; use
    /// [`acquire_async`](Self::acquire_async) there.
    pub fn acquire(&self, key: K) -> KeyGuard<K> {
        let (mutex, checkout) = self.checkout(key);
        let permit = mutex.blocking_lock_owned();
        KeyGuard {
            _permit: permit,
            checkout,
        }
    }

    /// Acquire every key in `keys`, de-duplicated and in ascending order.
    ///
    /// Two callers locking overlapping sets in different input orders cannot
    /// deadlock. If the future is dropped midway, keys already taken are
    /// released.
    pub async fn acquire_many_async(&self, keys: impl IntoIterator<Item = K>) -> MultiKeyGuard<K> {
        let ordered = sorted_unique(keys);
        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.acquire_async(key).await);
        }
        MultiKeyGuard { guards }
    }

    /// Blocking counterpart of [`acquire_many_async`](Self::acquire_many_async).
    pub fn acquire_many(&self, keys: impl IntoIterator<Item = K>) -> MultiKeyGuard<K> {
        let guards = sorted_unique(keys)
            .into_iter()
            .map(|key| self.acquire(key))
            .collect();
        MultiKeyGuard { guards }
    }

    /// Number of keys currently held or waited on.
    pub fn tracked_keys(&self) -> usize {
        self.table.len()
    }
}

fn sorted_unique<K: Ord>(keys: impl IntoIterator<Item = K>) -> Vec<K> {
    let mut keys: Vec<K> = keys.into_iter().collect();
    keys.sort();
    keys.dedup();
    keys
}

// =============================================================================
// TESTS
// =============================================================================
