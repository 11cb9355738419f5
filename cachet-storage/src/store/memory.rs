//! In-memory backing store.

use super::filter::StoreFilter;
use super::traits::{BackingStore, BulkWriteOutcome, WriteError, WriteErrorKind, WriteOp};
use ::async_trait::async_trait;
use cachet_core::{CachetError, CachetResult, Entity, SearchResult, StoreError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reference [`BackingStore`] keeping records in a `BTreeMap`, so queries
/// return records in key order.
///
/// Clones share the same records.
pub struct MemoryStore<R: Entity> {
    collection: String,
    records: Arc<RwLock<BTreeMap<R::Id, R>>>,
}

impl<R: Entity> Clone for MemoryStore<R> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            records: Arc::clone(&self.records),
        }
    }
}

impl<R: Entity> fmt::Debug for MemoryStore<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl<R: Entity> MemoryStore<R> {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            records: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Put records directly, bypassing version checks.
    pub fn seed(&self, records: impl IntoIterator<Item = R>) -> CachetResult<()> {
        let mut map = self.write()?;
        for record in records {
            map.insert(record.id(), record);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> CachetResult<()> {
        self.write()?.clear();
        Ok(())
    }

    /// Every stored record, in key order.
    pub fn snapshot(&self) -> CachetResult<Vec<R>> {
        Ok(self.read()?.values().cloned().collect())
    }

    fn read(&self) -> CachetResult<RwLockReadGuard<'_, BTreeMap<R::Id, R>>> {
        self.records
            .read()
            .map_err(|_| CachetError::Store(StoreError::LockPoisoned))
    }

    fn write(&self) -> CachetResult<RwLockWriteGuard<'_, BTreeMap<R::Id, R>>> {
        self.records
            .write()
            .map_err(|_| CachetError::Store(StoreError::LockPoisoned))
    }

    fn duplicate(&self, record: &R) -> CachetError {
        StoreError::DuplicateKey {
            collection: self.collection.clone(),
            id: record.id().to_string(),
        }
        .into()
    }

    fn replace_in(
        map: &mut BTreeMap<R::Id, R>,
        filter: &StoreFilter<R::Id>,
        record: &R,
    ) -> CachetResult<u64> {
        let id = record.id();
        let matched = match map.get(&id) {
            Some(existing) => filter.matches_record(existing)?,
            None => false,
        };
        if matched {
            map.insert(id, record.clone());
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn matching_ids(
        map: &BTreeMap<R::Id, R>,
        filter: &StoreFilter<R::Id>,
    ) -> CachetResult<Vec<R::Id>> {
        let mut ids = Vec::new();
        for (id, record) in map {
            if filter.matches_record(record)? {
                ids.push(id.clone());
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl<R: Entity> BackingStore<R> for MemoryStore<R> {
    fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn find_by_key(&self, id: &R::Id) -> CachetResult<Option<R>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn query(
        &self,
        filter: &StoreFilter<R::Id>,
        limit: Option<usize>,
    ) -> CachetResult<SearchResult<R>> {
        let map = self.read()?;
        let mut items = Vec::new();
        for record in map.values() {
            if let Some(limit) = limit {
                // one past the limit tells us whether there is more
                if items.len() > limit {
                    break;
                }
            }
            if filter.matches_record(record)? {
                items.push(record.clone());
            }
        }

        let has_more = matches!(limit, Some(limit) if items.len() > limit);
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(SearchResult::new(items, has_more))
    }

    async fn count(&self, filter: &StoreFilter<R::Id>, limit: Option<usize>) -> CachetResult<u64> {
        let map = self.read()?;
        let mut count = 0usize;
        for record in map.values() {
            if limit.is_some_and(|limit| count >= limit) {
                break;
            }
            if filter.matches_record(record)? {
                count += 1;
            }
        }
        Ok(count as u64)
    }

    async fn conditional_replace(
        &self,
        filter: &StoreFilter<R::Id>,
        record: &R,
    ) -> CachetResult<u64> {
        let mut map = self.write()?;
        Self::replace_in(&mut map, filter, record)
    }

    async fn insert(&self, record: &R) -> CachetResult<()> {
        let mut map = self.write()?;
        let id = record.id();
        if map.contains_key(&id) {
            return Err(self.duplicate(record));
        }
        map.insert(id, record.clone());
        Ok(())
    }

    async fn upsert(&self, record: &R) -> CachetResult<()> {
        self.write()?.insert(record.id(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &R::Id) -> CachetResult<Option<R>> {
        Ok(self.write()?.remove(id))
    }

    async fn delete_many(&self, filter: &StoreFilter<R::Id>) -> CachetResult<u64> {
        let mut map = self.write()?;
        let ids = Self::matching_ids(&map, filter)?;
        for id in &ids {
            map.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn bulk_write(
        &self,
        ops: Vec<WriteOp<R>>,
        ordered: bool,
    ) -> CachetResult<BulkWriteOutcome> {
        let mut map = self.write()?;
        let mut outcome = BulkWriteOutcome::default();

        for (index, op) in ops.into_iter().enumerate() {
            let failure = match op {
                WriteOp::Insert(record) => {
                    let id = record.id();
                    if map.contains_key(&id) {
                        Some(WriteError {
                            index,
                            kind: WriteErrorKind::DuplicateKey,
                            message: self.duplicate(&record).to_string(),
                        })
                    } else {
                        map.insert(id, record);
                        outcome.inserted_count += 1;
                        None
                    }
                }
                WriteOp::ReplaceOne { filter, record } => {
                    match Self::replace_in(&mut map, &filter, &record) {
                        Ok(modified) => {
                            outcome.modified_count += modified;
                            None
                        }
                        Err(e) => Some(WriteError {
                            index,
                            kind: WriteErrorKind::Other,
                            message: e.to_string(),
                        }),
                    }
                }
                WriteOp::Upsert(record) => {
                    if map.insert(record.id(), record).is_some() {
                        outcome.modified_count += 1;
                    } else {
                        outcome.upserted_count += 1;
                    }
                    None
                }
            };

            if let Some(error) = failure {
                outcome.write_errors.push(error);
                if ordered {
                    break;
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::{EntityHolder, FilterExpr};
    use serde_json::{json, Value};

    type Doc = EntityHolder<Value>;

    fn doc(id: &str, version: i64) -> Doc {
        EntityHolder::new(id, json!({ "n": version })).with_version(version)
    }

    fn store_with(ids: &[&str]) -> MemoryStore<Doc> {
        let store = MemoryStore::new("docs");
        store.seed(ids.iter().map(|id| doc(id, 1))).unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_key() {
        let store = store_with(&["a"]);
        let err = store.insert(&doc("a", 1)).await.unwrap_err();
        assert!(matches!(
            err,
            CachetError::Store(StoreError::DuplicateKey { ref id, .. }) if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_conditional_replace_checks_filter() {
        let store = store_with(&["a"]);

        let stale = StoreFilter::id_and_version("a".to_string(), 5);
        assert_eq!(store.conditional_replace(&stale, &doc("a", 6)).await.unwrap(), 0);

        let current = StoreFilter::id_and_version("a".to_string(), 1);
        assert_eq!(store.conditional_replace(&current, &doc("a", 2)).await.unwrap(), 1);
        assert_eq!(store.find_by_key(&"a".to_string()).await.unwrap().unwrap().data_version, 2);

        let missing = StoreFilter::id_and_version("zz".to_string(), 1);
        assert_eq!(store.conditional_replace(&missing, &doc("zz", 2)).await.unwrap(), 0);
        assert!(store.find_by_key(&"zz".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_limit_sets_has_more() {
        let store = store_with(&["a", "b", "c"]);

        let page = store.query(&StoreFilter::All, Some(2)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.has_more);

        let all = store.query(&StoreFilter::All, Some(3)).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(!all.has_more);

        let unlimited = store.query(&StoreFilter::All, None).await.unwrap();
        assert_eq!(unlimited.len(), 3);
        assert!(!unlimited.has_more);
    }

    #[tokio::test]
    async fn test_count_and_delete_many() {
        let store = store_with(&["a", "b", "c"]);
        let filter = StoreFilter::IdIn(vec!["a".to_string(), "c".to_string()]);

        assert_eq!(store.count(&filter, None).await.unwrap(), 2);
        assert_eq!(store.count(&StoreFilter::All, Some(1)).await.unwrap(), 1);
        assert_eq!(store.delete_many(&filter).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_field_filter_on_payload() {
        let store = MemoryStore::new("docs");
        store.seed(vec![doc("a", 1), doc("b", 2)]).unwrap();

        let filter = StoreFilter::Field(FilterExpr::gt("data.n", json!(1)));
        let found = store.query(&filter, None).await.unwrap();
        let ids: Vec<&str> = found.items.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn test_unordered_bulk_write_continues_after_failure() {
        let store = store_with(&["a"]);
        let ops = vec![
            WriteOp::Insert(doc("a", 1)),
            WriteOp::Insert(doc("b", 1)),
            WriteOp::ReplaceOne {
                filter: StoreFilter::id_and_version("a".to_string(), 1),
                record: doc("a", 2),
            },
            WriteOp::Upsert(doc("c", 1)),
        ];

        let outcome = store.bulk_write(ops, false).await.unwrap();
        assert_eq!(outcome.inserted_count, 1);
        assert_eq!(outcome.modified_count, 1);
        assert_eq!(outcome.upserted_count, 1);
        assert_eq!(outcome.write_errors.len(), 1);
        assert_eq!(outcome.write_errors[0].index, 0);
        assert!(outcome.has_duplicate_key());
        assert!(outcome.first_other_error().is_none());
    }

    #[tokio::test]
    async fn test_ordered_bulk_write_stops_at_first_failure() {
        let store = store_with(&["a"]);
        let ops = vec![WriteOp::Insert(doc("a", 1)), WriteOp::Insert(doc("b", 1))];

        let outcome = store.bulk_write(ops, true).await.unwrap();
        assert_eq!(outcome.inserted_count, 0);
        assert!(store.find_by_key(&"b".to_string()).await.unwrap().is_none());
    }
}
