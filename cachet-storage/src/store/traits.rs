//! Backing store seam.
//!
//! A [`BackingStore`] is a durable keyed document collection. The versioned
//! adapter only needs keyed lookups, conditional replacement, inserts that
//! reject duplicate keys, and an unordered bulk write that reports counts.

use super::filter::StoreFilter;
use ::async_trait::async_trait;
use cachet_core::{CachetResult, Entity, HasId, SearchResult};

/// Async document collection holding records of type `R`.
#[async_trait]
pub trait BackingStore<R: Entity>: Send + Sync {
    /// Collection name, used in errors, logs and metrics.
    fn collection_name(&self) -> &str;

    // ========================================================================
    // READS
    // ========================================================================

    async fn find_by_key(&self, id: &R::Id) -> CachetResult<Option<R>>;

    /// Records matching `filter`, at most `limit` of them.
    async fn query(
        &self,
        filter: &StoreFilter<R::Id>,
        limit: Option<usize>,
    ) -> CachetResult<SearchResult<R>>;

    /// Number of matching records, capped at `limit`.
    async fn count(&self, filter: &StoreFilter<R::Id>, limit: Option<usize>) -> CachetResult<u64>;

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Replace the record with `record`'s id when it also matches `filter`.
    /// Returns the number of records modified (0 or 1).
    async fn conditional_replace(&self, filter: &StoreFilter<R::Id>, record: &R)
        -> CachetResult<u64>;

    /// Insert a new record. Fails with `StoreError::DuplicateKey` if the id
    /// already exists.
    async fn insert(&self, record: &R) -> CachetResult<()>;

    /// Insert or replace unconditionally.
    async fn upsert(&self, record: &R) -> CachetResult<()>;

    /// Remove by id, returning the removed record.
    async fn delete(&self, id: &R::Id) -> CachetResult<Option<R>>;

    /// Remove every matching record. Returns how many were removed.
    async fn delete_many(&self, filter: &StoreFilter<R::Id>) -> CachetResult<u64>;

    /// Apply a batch of writes. Unordered batches keep going after a failed
    /// operation; ordered batches stop at the first one. Per-operation
    /// failures are reported in the outcome, not as an `Err`.
    async fn bulk_write(&self, ops: Vec<WriteOp<R>>, ordered: bool)
        -> CachetResult<BulkWriteOutcome>;
}

/// One operation in a bulk write.
#[derive(Debug, Clone)]
pub enum WriteOp<R: HasId> {
    Insert(R),
    /// Replace the record with the same id if it matches `filter`.
    ReplaceOne {
        filter: StoreFilter<R::Id>,
        record: R,
    },
    Upsert(R),
}

/// What a bulk write did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub inserted_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
    pub write_errors: Vec<WriteError>,
}

impl BulkWriteOutcome {
    pub fn has_duplicate_key(&self) -> bool {
        self.write_errors
            .iter()
            .any(|e| e.kind == WriteErrorKind::DuplicateKey)
    }

    /// First failure that is not a duplicate key.
    pub fn first_other_error(&self) -> Option<&WriteError> {
        self.write_errors
            .iter()
            .find(|e| e.kind != WriteErrorKind::DuplicateKey)
    }
}

/// A single failed operation in a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError {
    /// Position of the operation in the submitted batch.
    pub index: usize,
    pub kind: WriteErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    DuplicateKey,
    Other,
}
