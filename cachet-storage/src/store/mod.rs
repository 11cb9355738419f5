//! Backing store abstraction and the in-memory reference store.

pub mod filter;
pub mod memory;
pub mod traits;

pub use filter::{to_store_filter, StoreFilter};
pub use memory::MemoryStore;
pub use traits::{BackingStore, BulkWriteOutcome, WriteError, WriteErrorKind, WriteOp};
