//! CACHET Events - Entity change notifications
//!
//! Repositories raise an event after every committed write and every delete
//! that actually removed a record. Two delivery paths exist side by side:
//!
//! - synchronous [`ChangeListener`]s, called inline on the writer's task
//! - a tokio broadcast channel for async consumers ([`ChangeNotifier::subscribe`])
//!
//! ```text
//! repository write ──→ ChangeNotifier ──┬─→ listener.on_changed(&entity)
//!                                       └─→ broadcast::Sender<ChangeEvent<T>>
//! ```

mod notifier;

pub use notifier::{ChangeEvent, ChangeListener, ChangeNotifier, DEFAULT_CHANNEL_CAPACITY};
