//! Storage traits and implementations
//!
//! The scheduler only reads accounts and mailboxes through [`SyncStore`];
//! the in-memory and SQLite implementations are provided for tests and the
//! daemon.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemorySyncStore;
pub use sqlite::SqliteSyncStore;
pub use traits::{MailboxFilter, StoreChange, StoreListener, SyncStore};
