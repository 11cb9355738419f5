//! CACHET Storage - Cache, versioned store and cached repository
//!
//! Three layers, each usable on its own:
//!
//! ```text
//! CachedRepository ──→ TaggedCache      (in-process, tag index, LRU + TTL)
//!        │         ──→ KeyedLock        (cachet-core, per-key serialization)
//!        ▼
//! VersionedStore   ──→ BackingStore     (async trait; MemoryStore provided)
//! ```
//!
//! - [`TaggedCache`]: bounded key/value cache with a secondary tag index
//! - [`VersionedStore`]: enforces the optimistic `data_version` protocol
//!   on top of any [`BackingStore`]
//! - [`CachedRepository`]: read-through/write-through facade combining the two

pub mod cache;
pub mod repository;
pub mod store;
pub mod versioned;

pub use cache::{CacheEntry, CacheTag, RemovedSubscriber, TaggedCache, TaggedCacheBuilder};
pub use repository::{CachedRepository, CachedRepositoryBuilder, Tagger};
pub use store::{
    to_store_filter, BackingStore, BulkWriteOutcome, MemoryStore, StoreFilter, WriteError,
    WriteErrorKind, WriteOp,
};
pub use versioned::{VersionedStore, WriteState};
