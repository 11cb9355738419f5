//! CACHET Manager - command handling over cached repositories
//!
//! [`GenericManager`] accepts [`WriteCommand`](cachet_core::WriteCommand)s,
//! resolves ids and versions against the stored entity, and writes through
//! a [`CachedRepository`](cachet_storage::CachedRepository). Version
//! conflicts with concurrent writers are retried with a fixed delay; bulk
//! updates run behind a bulkhead.
//!
//! ```text
//! WriteCommand ──→ prepare (id, version, created date)
//!                     │
//!                     ▼
//!               repository.update ──conflict──→ sleep, reload, prepare again
//! ```

pub mod bulk;
pub mod manager;
mod retry;

pub use bulk::{BulkWriteItem, BulkWriteResult};
pub use manager::GenericManager;
