//! CACHET Core - shared types for the cached repository framework
//!
//! Errors, the entity/version model, query specifications, clocks,
//! configuration, observer seams and the keyed lock. Every other cachet
//! crate depends on this one.

use chrono::{DateTime, Utc};

pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod lock;
pub mod observer;
pub mod specification;
pub mod timing;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheSettings, ManagerSettings, RepositorySettings, RetryConfig};
pub use entity::{
    Entity, EntityHolder, HasId, Versioned, WriteCommand, INITIAL_DATA_VERSION,
};
pub use error::{
    CachetError, CachetResult, ConcurrencyError, ConfigError, StoreError, ValidationError,
};
pub use filter::{FilterExpr, FilterOperator};
pub use lock::{KeyGuard, KeyedLock, MultiKeyGuard};
pub use observer::{
    CacheObserver, ManagerObserver, NullCacheObserver, NullManagerObserver,
    NullRepositoryObserver, RepositoryObserver,
};
pub use specification::{SearchOptions, SearchResult, Specification};
pub use timing::TimeGuard;
