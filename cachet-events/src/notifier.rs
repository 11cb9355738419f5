//! Change notifier.

use cachet_core::observer::notify;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per slow subscriber before it starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A committed change to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "entity")]
pub enum ChangeEvent<T> {
    /// Created or updated; carries the new snapshot.
    Changed(T),
    /// Removed; carries the snapshot that was deleted.
    Deleted(T),
}

impl<T> ChangeEvent<T> {
    pub fn event_type(&self) -> &'static str {
        match self {
            ChangeEvent::Changed(_) => "changed",
            ChangeEvent::Deleted(_) => "deleted",
        }
    }

    pub fn entity(&self) -> &T {
        match self {
            ChangeEvent::Changed(entity) | ChangeEvent::Deleted(entity) => entity,
        }
    }

    pub fn into_entity(self) -> T {
        match self {
            ChangeEvent::Changed(entity) | ChangeEvent::Deleted(entity) => entity,
        }
    }
}

/// Synchronous change subscriber. Panics are caught and logged.
pub trait ChangeListener<T>: Send + Sync {
    fn on_changed(&self, _entity: &T) {}
    fn on_deleted(&self, _entity: &T) {}
}

/// Fans change events out to listeners and broadcast subscribers.
///
/// Clones share listeners and the channel.
pub struct ChangeNotifier<T> {
    listeners: Arc<RwLock<Vec<Arc<dyn ChangeListener<T>>>>>,
    tx: broadcast::Sender<ChangeEvent<T>>,
}

impl<T> Clone for ChangeNotifier<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for ChangeNotifier<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl<T: Clone + Send + 'static> ChangeNotifier<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            tx,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener<T>>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Receive every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent<T>> {
        self.tx.subscribe()
    }

    pub fn notify_changed(&self, entity: &T) {
        self.dispatch(|listener| listener.on_changed(entity), "on_changed");
        self.broadcast(ChangeEvent::Changed(entity.clone()));
    }

    pub fn notify_deleted(&self, entity: &T) {
        self.dispatch(|listener| listener.on_deleted(entity), "on_deleted");
        self.broadcast(ChangeEvent::Deleted(entity.clone()));
    }

    fn dispatch(&self, call: impl Fn(&dyn ChangeListener<T>), what: &str) {
        // Snapshot so listeners may register more listeners.
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            notify(what, || call(listener.as_ref()));
        }
    }

    fn broadcast(&self, event: ChangeEvent<T>) {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => debug!(event_type, receivers, "Broadcast change event"),
            Err(_) => debug!(event_type, "No receivers for change event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl ChangeListener<String> for Recorder {
        fn on_changed(&self, entity: &String) {
            self.seen.lock().unwrap().push(format!("changed:{entity}"));
        }

        fn on_deleted(&self, entity: &String) {
            self.seen.lock().unwrap().push(format!("deleted:{entity}"));
        }
    }

    struct Exploding;

    impl ChangeListener<String> for Exploding {
        fn on_changed(&self, _entity: &String) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_listeners_receive_events_in_order() {
        let notifier = ChangeNotifier::<String>::default();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(recorder.clone());

        notifier.notify_changed(&"a".to_string());
        notifier.notify_deleted(&"a".to_string());

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["changed:a", "deleted:a"]);
        assert_eq!(notifier.listener_count(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let notifier = ChangeNotifier::<String>::default();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(Arc::new(Exploding));
        notifier.add_listener(recorder.clone());

        notifier.notify_changed(&"b".to_string());

        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_receive_events() {
        let notifier = ChangeNotifier::<String>::new(8);
        let mut rx = notifier.subscribe();

        notifier.notify_changed(&"x".to_string());
        notifier.notify_deleted(&"y".to_string());

        let first = rx.recv().await.unwrap();
        assert_eq!(first, ChangeEvent::Changed("x".to_string()));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type(), "deleted");
        assert_eq!(second.into_entity(), "y");
    }

    #[test]
    fn test_notify_without_subscribers_is_fine() {
        let notifier = ChangeNotifier::<u32>::new(0);
        notifier.notify_changed(&1);
    }
}
