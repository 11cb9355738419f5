//! Command-driven manager over a cached repository.

use crate::bulk::{BulkWriteItem, BulkWriteResult};
use crate::retry::{AttemptError, Backoff};
use cachet_core::observer::notify;
use cachet_core::{
    CachetResult, ConcurrencyError, EntityHolder, ManagerObserver, ManagerSettings,
    NullManagerObserver, SearchOptions, SearchResult, Specification, WriteCommand,
    INITIAL_DATA_VERSION,
};
use cachet_events::ChangeNotifier;
use cachet_storage::{BackingStore, CachedRepository};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Turns [`WriteCommand`]s into versioned [`EntityHolder`] writes.
///
/// Every write re-reads the stored version, fills in what the command left
/// open and retries on version conflicts per [`ManagerSettings::retry`].
pub struct GenericManager<T, S>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    repository: Arc<CachedRepository<EntityHolder<T>, S>>,
    settings: ManagerSettings,
    observer: Arc<dyn ManagerObserver>,
}

impl<T, S> fmt::Debug for GenericManager<T, S>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericManager")
            .field("repository", &self.repository)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<T, S> GenericManager<T, S>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    S: BackingStore<EntityHolder<T>>,
{
    pub fn new(repository: Arc<CachedRepository<EntityHolder<T>, S>>) -> Self {
        Self {
            repository,
            settings: ManagerSettings::default(),
            observer: Arc::new(NullManagerObserver),
        }
    }

    pub fn with_settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ManagerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn repository(&self) -> &CachedRepository<EntityHolder<T>, S> {
        &self.repository
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Changed/deleted events for every committed write.
    pub fn notifier(&self) -> &ChangeNotifier<EntityHolder<T>> {
        self.repository.notifier()
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn get(&self, id: &str) -> CachetResult<Option<EntityHolder<T>>> {
        self.observe("get", self.repository.get(&id.to_string()))
            .await
    }

    pub async fn get_many(&self, ids: &[String]) -> CachetResult<Vec<EntityHolder<T>>> {
        self.observe("get_many", self.repository.get_many(ids)).await
    }

    pub async fn get_all(&self) -> CachetResult<Vec<EntityHolder<T>>> {
        self.observe("get_all", self.repository.get_all()).await
    }

    pub async fn search(
        &self,
        spec: &Specification<String>,
        options: &SearchOptions,
    ) -> CachetResult<SearchResult<EntityHolder<T>>> {
        self.observe("search", self.repository.search(spec, options))
            .await
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Create or update the entity described by `command`. Returns the
    /// saved id.
    ///
    /// - no id: a new UUIDv7 id at the initial version
    /// - known id, no version: one past the stored version
    /// - known id, explicit version below stored + 1: `VersionMismatch`,
    ///   never retried
    /// - unknown id: created at the initial version
    pub async fn update(&self, command: WriteCommand<T>) -> CachetResult<String> {
        self.observe("update", self.update_with_retry(command))
            .await
    }

    /// Delete by id. `Ok(None)` when there was nothing to delete.
    pub async fn delete(&self, entity_id: &str) -> CachetResult<Option<EntityHolder<T>>> {
        self.observe("delete", self.delete_with_retry(entity_id))
            .await
    }

    /// Run [`update`](Self::update) for every command with at most
    /// `bulkhead` in flight. Failures are reported per item; items come
    /// back in submission order.
    pub async fn bulk_update(&self, commands: Vec<WriteCommand<T>>) -> BulkWriteResult {
        let started = Instant::now();
        let bulkhead = self.settings.bulkhead.max(1);
        debug!(
            collection = self.repository.collection_name(),
            commands = commands.len(),
            bulkhead,
            "Bulk update started"
        );

        let items = stream::iter(commands)
            .map(|command| async move {
                let entity_id = command.entity_id.clone();
                match self.update(command).await {
                    Ok(id) => BulkWriteItem::ok(id),
                    Err(error) => BulkWriteItem::failed(entity_id, &error),
                }
            })
            .buffered(bulkhead)
            .collect::<Vec<_>>()
            .await;
        let result = BulkWriteResult { items };

        debug!(
            collection = self.repository.collection_name(),
            succeeded = result.succeeded(),
            failed = result.failed(),
            "Bulk update finished"
        );
        self.report("bulk_update", started.elapsed(), result.all_ok());
        result
    }

    async fn update_with_retry(&self, mut command: WriteCommand<T>) -> CachetResult<String> {
        let fresh = !has_entity_id(&command);
        if fresh {
            command.entity_id = Some(Uuid::now_v7().to_string());
        }
        debug!(
            collection = self.repository.collection_name(),
            entity_id = ?command.entity_id,
            data_version = ?command.data_version,
            "Update command handled"
        );

        let mut backoff = Backoff::new("update", &self.settings.retry, self.observer.as_ref());
        loop {
            let reload = backoff.retries() > 0;
            let error = match self.try_update(&command, fresh, reload).await {
                Ok(id) => return Ok(id),
                Err(error) => error,
            };
            if !backoff.retry(&error).await {
                return Err(error.into_inner());
            }
        }
    }

    async fn try_update(
        &self,
        command: &WriteCommand<T>,
        fresh: bool,
        reload: bool,
    ) -> Result<String, AttemptError> {
        let prepared = self.prepare(command, fresh, reload).await?;
        let snapshot = prepared.create_snapshot();
        let id = snapshot.id.clone();
        self.repository.update(snapshot).await?;
        Ok(id)
    }

    /// Fill in the version and created date the command left open.
    async fn prepare(
        &self,
        command: &WriteCommand<T>,
        fresh: bool,
        reload: bool,
    ) -> Result<WriteCommand<T>, AttemptError> {
        let mut prepared = command.clone();
        let entity_id = match prepared.entity_id.clone() {
            Some(id) if !fresh => id,
            _ => return Ok(initial(prepared)),
        };

        // After a conflict the cached copy may be the one we lost to.
        if reload {
            self.repository.invalidate(&entity_id);
        }
        let Some(holder) = self.repository.get(&entity_id).await? else {
            return Ok(initial(prepared));
        };

        let next_version = holder.data_version + 1;
        prepared.created_time = holder.created_date;
        match command.data_version {
            None => prepared.data_version = Some(next_version),
            // Behind or ahead of the stored version; no retry can fix either.
            Some(version) if version != next_version => {
                debug!(
                    collection = self.repository.collection_name(),
                    entity_id = %entity_id,
                    data_version = version,
                    next_version,
                    "Data version in update command does not follow stored version"
                );
                return Err(AttemptError::Fatal(
                    ConcurrencyError::version_mismatch(
                        entity_id,
                        Some(holder.data_version),
                        Some(version),
                    )
                    .into(),
                ));
            }
            Some(_) => {}
        }
        Ok(prepared)
    }

    async fn delete_with_retry(&self, entity_id: &str) -> CachetResult<Option<EntityHolder<T>>> {
        let collection = self.repository.collection_name();
        debug!(collection, entity_id, "Delete command handled");

        let id = entity_id.to_string();
        let mut backoff = Backoff::new("delete", &self.settings.retry, self.observer.as_ref());
        loop {
            let error = match self.repository.delete(&id).await {
                Ok(Some(removed)) => {
                    info!(collection, entity_id, "Entity removed");
                    return Ok(Some(removed));
                }
                Ok(None) => {
                    debug!(collection, entity_id, "Entity already removed");
                    return Ok(None);
                }
                Err(error) => AttemptError::from(error),
            };
            if !backoff.retry(&error).await {
                return Err(error.into_inner());
            }
        }
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    async fn observe<X>(
        &self,
        action: &'static str,
        work: impl Future<Output = CachetResult<X>>,
    ) -> CachetResult<X> {
        let started = Instant::now();
        let result = work.await;
        self.report(action, started.elapsed(), result.is_ok());
        result
    }

    fn report(&self, action: &'static str, elapsed: Duration, ok: bool) {
        let observer = &self.observer;
        notify("on_action", || observer.on_action(action, elapsed, ok));
    }
}

fn has_entity_id<T>(command: &WriteCommand<T>) -> bool {
    command
        .entity_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty())
}

/// A command creating its entity: initial version, created now.
fn initial<T>(mut command: WriteCommand<T>) -> WriteCommand<T> {
    command.data_version = Some(INITIAL_DATA_VERSION);
    command.created_time = Utc::now();
    command
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::{CachetError, RetryConfig};
    use cachet_storage::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
        }
    }

    type Store = MemoryStore<EntityHolder<Note>>;

    fn manager() -> (Arc<Store>, GenericManager<Note, Store>) {
        let store = Arc::new(MemoryStore::new("notes"));
        let repository = Arc::new(CachedRepository::new(Arc::clone(&store)));
        let settings = ManagerSettings::default()
            .with_retry(RetryConfig::default().with_delay(Duration::from_millis(1)));
        (store, GenericManager::new(repository).with_settings(settings))
    }

    #[test]
    fn test_has_entity_id() {
        assert!(!has_entity_id(&WriteCommand::create(note("a"))));
        assert!(!has_entity_id(&WriteCommand::update("  ", note("a"))));
        assert!(has_entity_id(&WriteCommand::update("n1", note("a"))));
    }

    #[test]
    fn test_initial_sets_first_version() {
        let command = initial(WriteCommand::update("n1", note("a")).with_version(7));
        assert_eq!(command.data_version, Some(INITIAL_DATA_VERSION));
    }

    #[tokio::test]
    async fn test_create_generates_uuid_v7_id() {
        let (store, manager) = manager();
        let id = manager.update(WriteCommand::create(note("hello"))).await.unwrap();

        let parsed = Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 7);

        let stored = store.find_by_key(&id).await.unwrap().unwrap();
        assert_eq!(stored.data_version, INITIAL_DATA_VERSION);
        assert_eq!(stored.data.text, "hello");
    }

    #[tokio::test]
    async fn test_update_without_version_takes_next() {
        let (store, manager) = manager();
        let id = manager.update(WriteCommand::create(note("v1"))).await.unwrap();
        let created = store.find_by_key(&id).await.unwrap().unwrap();

        manager
            .update(WriteCommand::update(id.clone(), note("v2")).with_user("ana"))
            .await
            .unwrap();

        let stored = store.find_by_key(&id).await.unwrap().unwrap();
        assert_eq!(stored.data_version, 2);
        assert_eq!(stored.data.text, "v2");
        assert_eq!(stored.created_date, created.created_date);
        assert_eq!(stored.modified_by.as_deref(), Some("ana"));
    }

    #[tokio::test]
    async fn test_stale_explicit_version_is_rejected() {
        let (_store, manager) = manager();
        let id = manager.update(WriteCommand::update("n1", note("v1"))).await.unwrap();
        manager.update(WriteCommand::update(id.clone(), note("v2"))).await.unwrap();

        let result = manager
            .update(WriteCommand::update(id, note("stale")).with_version(2))
            .await;
        match result {
            Err(CachetError::Concurrency(ConcurrencyError::VersionMismatch {
                id,
                current_version,
                update_version,
            })) => {
                assert_eq!(id.as_deref(), Some("n1"));
                assert_eq!(current_version, Some(2));
                assert_eq!(update_version, Some(2));
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_id_is_created_at_initial_version() {
        let (store, manager) = manager();
        let id = manager
            .update(WriteCommand::update("n9", note("x")).with_version(4))
            .await
            .unwrap();
        assert_eq!(id, "n9");
        assert_eq!(
            store.find_by_key(&id).await.unwrap().unwrap().data_version,
            INITIAL_DATA_VERSION
        );
    }

    #[tokio::test]
    async fn test_delete_missing_is_none() {
        let (_store, manager) = manager();
        assert!(manager.delete("ghost").await.unwrap().is_none());

        let id = manager.update(WriteCommand::create(note("x"))).await.unwrap();
        let removed = manager.delete(&id).await.unwrap().unwrap();
        assert_eq!(removed.id, id);
        assert!(manager.get(&id).await.unwrap().is_none());
    }
}
