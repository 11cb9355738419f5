//! Manager behavior against an instrumented store.

use cachet_core::{
    EntityHolder, ManagerSettings, RetryConfig, SearchOptions, Specification,
    WriteCommand,
};
use cachet_manager::GenericManager;
use cachet_storage::{BackingStore, CachedRepository};
use cachet_test_utils::observers::RecordingManagerObserver;
use cachet_test_utils::{assertions, CachetError, InstrumentedStore};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ticket {
    title: String,
    points: u32,
}

fn ticket(title: &str) -> Ticket {
    Ticket {
        title: title.to_string(),
        points: 1,
    }
}

type Store = InstrumentedStore<EntityHolder<Ticket>>;

struct Harness {
    store: Arc<Store>,
    observer: Arc<RecordingManagerObserver>,
    manager: Arc<GenericManager<Ticket, Store>>,
}

fn harness(settings: ManagerSettings) -> Harness {
    let store = Arc::new(InstrumentedStore::memory("tickets"));
    let observer = Arc::new(RecordingManagerObserver::default());
    let repository = Arc::new(CachedRepository::new(Arc::clone(&store)));
    let manager = GenericManager::new(repository)
        .with_settings(settings)
        .with_observer(observer.clone());
    Harness {
        store,
        observer,
        manager: Arc::new(manager),
    }
}

fn fast_retries(max_retries: u32) -> ManagerSettings {
    ManagerSettings::default().with_retry(
        RetryConfig::default()
            .with_max_retries(max_retries)
            .with_delay(Duration::from_millis(1)),
    )
}

async fn stored_version(store: &Store, id: &str) -> i64 {
    store
        .inner()
        .find_by_key(&id.to_string())
        .await
        .unwrap()
        .map(|holder| holder.data_version)
        .unwrap_or(-1)
}

#[tokio::test]
async fn test_retry_recovers_from_transient_conflicts() {
    let h = harness(fast_retries(10));
    let id = h
        .manager
        .update(WriteCommand::update("t1", ticket("first")))
        .await
        .unwrap();

    h.store.lose_next_replaces(3);
    h.manager
        .update(WriteCommand::update(id.clone(), ticket("second")))
        .await
        .unwrap();

    assert_eq!(stored_version(&h.store, &id).await, 2);
    assert_eq!(h.observer.retries(), 3);
    assert_eq!(h.observer.count("retry:update:3"), 1);
    assert_eq!(h.observer.count("update"), 2);
}

#[tokio::test]
async fn test_retry_gives_up_after_configured_attempts() {
    let h = harness(fast_retries(2));
    h.manager
        .update(WriteCommand::update("t1", ticket("first")))
        .await
        .unwrap();

    h.store.lose_next_replaces(10);
    let result = h
        .manager
        .update(WriteCommand::update("t1", ticket("second")))
        .await;

    assertions::assert_version_mismatch(&result, "t1", 1, 2);
    assert_eq!(h.observer.retries(), 2);
    assert_eq!(h.store.counts().conditional_replace, 3);
    assert_eq!(h.observer.count("update_failed"), 1);
    assert_eq!(stored_version(&h.store, "t1").await, 1);
}

#[tokio::test]
async fn test_store_failures_are_not_retried() {
    let h = harness(fast_retries(10));
    h.store.fail_next_writes(1);

    let result = h.manager.update(WriteCommand::create(ticket("x"))).await;
    assertions::assert_store_error(&result);
    assert_eq!(h.observer.retries(), 0);
}

#[tokio::test]
async fn test_stale_explicit_version_fails_without_retry() {
    let h = harness(fast_retries(10));
    h.manager
        .update(WriteCommand::update("t1", ticket("a")))
        .await
        .unwrap();

    let result = h
        .manager
        .update(WriteCommand::update("t1", ticket("b")).with_version(1))
        .await;

    assertions::assert_version_mismatch(&result, "t1", 1, 1);
    assert_eq!(h.observer.retries(), 0);
}

#[tokio::test]
async fn test_explicit_version_ahead_of_store_fails_without_retry() {
    let h = harness(fast_retries(10));
    h.manager
        .update(WriteCommand::update("t1", ticket("a")))
        .await
        .unwrap();
    h.store.reset_counts();

    let result = h
        .manager
        .update(WriteCommand::update("t1", ticket("b")).with_version(5))
        .await;

    assertions::assert_version_mismatch(&result, "t1", 1, 5);
    assert_eq!(h.observer.retries(), 0);
    assert_eq!(h.store.counts().conditional_replace, 0);
    assert_eq!(stored_version(&h.store, "t1").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_versionless_updates_all_land() {
    let h = harness(fast_retries(20));
    let id = h
        .manager
        .update(WriteCommand::update("hot", ticket("v1")))
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&h.manager);
            let id = id.clone();
            tokio::spawn(async move {
                manager
                    .update(WriteCommand::update(id, ticket(&format!("writer {i}"))))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(stored_version(&h.store, &id).await, 9);
    assert_eq!(h.manager.repository().locks().tracked_keys(), 0);
}

#[tokio::test]
async fn test_bulk_update_reports_each_item_in_order() {
    let h = harness(fast_retries(3).with_bulkhead(2));
    h.manager
        .update(WriteCommand::update("t0", ticket("seed")))
        .await
        .unwrap();
    h.manager
        .update(WriteCommand::update("t0", ticket("seed 2")))
        .await
        .unwrap();

    let commands = vec![
        WriteCommand::update("t1", ticket("a")),
        WriteCommand::update("t0", ticket("stale")).with_version(2),
        WriteCommand::create(ticket("b")),
        WriteCommand::update("t0", ticket("fine")),
        WriteCommand::update("t2", ticket("c")),
    ];
    let result = h.manager.bulk_update(commands).await;

    assert_eq!(result.len(), 5);
    assert_eq!(result.succeeded(), 4);
    assert_eq!(result.items[0].entity_id.as_deref(), Some("t1"));
    assert!(!result.items[1].is_ok);
    assert_eq!(result.items[1].entity_id.as_deref(), Some("t0"));
    assert!(result.items[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Version mismatch")));
    assert!(result.items[2].is_ok);
    assert!(result.items[2].entity_id.is_some());
    assert_eq!(result.items[4].entity_id.as_deref(), Some("t2"));

    assert_eq!(h.observer.count("bulk_update_failed"), 1);
    assert_eq!(h.observer.count("update_failed"), 1);
}

#[tokio::test]
async fn test_bulk_update_of_nothing() {
    let h = harness(ManagerSettings::default());
    let result = h.manager.bulk_update(Vec::new()).await;
    assert!(result.is_empty());
    assert_eq!(h.observer.events(), vec!["bulk_update"]);
}

#[tokio::test]
async fn test_reads_pass_through_and_are_observed() {
    let h = harness(ManagerSettings::default());
    for id in ["t1", "t2", "t3"] {
        h.manager
            .update(WriteCommand::update(id, ticket(id)))
            .await
            .unwrap();
    }

    assert!(h.manager.get("t1").await.unwrap().is_some());
    let many = h
        .manager
        .get_many(&["t1".to_string(), "t3".to_string(), "nope".to_string()])
        .await
        .unwrap();
    assert_eq!(many.len(), 2);
    assert_eq!(h.manager.get_all().await.unwrap().len(), 3);
    let found = h
        .manager
        .search(
            &Specification::many_ids(["t2".to_string()]),
            &SearchOptions::unlimited(),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.items[0].data.title, "t2");

    for action in ["get", "get_many", "get_all", "search"] {
        assert_eq!(h.observer.count(action), 1, "{action}");
    }
}

#[tokio::test]
async fn test_delete_emits_event_and_is_idempotent() {
    let h = harness(ManagerSettings::default());
    let mut events = h.manager.notifier().subscribe();
    let id = h
        .manager
        .update(WriteCommand::create(ticket("gone soon")))
        .await
        .unwrap();

    assert!(h.manager.delete(&id).await.unwrap().is_some());
    assert!(h.manager.delete(&id).await.unwrap().is_none());

    assert_eq!(events.recv().await.unwrap().event_type(), "changed");
    let deleted = events.recv().await.unwrap();
    assert_eq!(deleted.event_type(), "deleted");
    assert_eq!(deleted.entity().id, id);
    assert!(events.try_recv().is_err());
    assert_eq!(h.observer.count("delete"), 2);
}

#[tokio::test]
async fn test_delete_failure_surfaces() {
    let h = harness(ManagerSettings::default());
    h.manager
        .update(WriteCommand::update("t1", ticket("x")))
        .await
        .unwrap();

    h.store.fail_next_writes(1);
    let result = h.manager.delete("t1").await;
    assert!(matches!(result, Err(CachetError::Store(_))));
    assert_eq!(h.observer.count("delete_failed"), 1);
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_versionless_updates_advance_one_version_each(
        titles in prop::collection::vec("[a-z]{1,8}", 1..12),
    ) {
        let h = harness(ManagerSettings::default());
        let final_version = block_on(async {
            for title in &titles {
                h.manager
                    .update(WriteCommand::update("p", ticket(title)))
                    .await
                    .unwrap();
            }
            stored_version(&h.store, "p").await
        });
        prop_assert_eq!(final_version, titles.len() as i64);
    }
}
