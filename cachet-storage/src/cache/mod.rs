//! In-process cache with a tag index.
//!
//! [`TaggedCache`] is a bounded key/value map with sliding expiration and a
//! secondary index from [`CacheTag`] to the entries carrying it, so groups of
//! entries can be selected or invalidated together.
//!
//! # Example
//!
//! ```ignore
//! let cache: TaggedCache<String, Order> = TaggedCache::new("orders", CacheSettings::default());
//! cache.add(order.id.clone(), order, [CacheTag::new("customer", [&customer_id])]);
//!
//! let orders = cache.select_by_tag(&CacheTag::new("customer", [&customer_id]));
//! ```

pub mod tag;
pub mod tagged;

pub use tag::CacheTag;
pub use tagged::{CacheEntry, RemovedSubscriber, TaggedCache, TaggedCacheBuilder};
