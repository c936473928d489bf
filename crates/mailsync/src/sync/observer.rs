//! Status callbacks to interested parties (UI, notifications)

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::error;
use parking_lot::RwLock;

use crate::models::{AccountId, MailboxId};

/// Status reported for a mailbox or an account's folder list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    InProgress,
    Success,
    ConnectionError,
    LoginFailed,
    SecurityFailure,
    AccessDenied,
    InternalError,
}

/// Receives sync status callbacks
///
/// All methods have empty defaults so observers implement only what they need.
pub trait SyncObserver: Send + Sync {
    /// Progress of one mailbox sync (0-100)
    fn sync_mailbox_status(&self, _mailbox_id: MailboxId, _status: SyncStatus, _progress: u8) {}

    /// Progress of an account's folder list refresh (0-100)
    fn sync_mailbox_list_status(&self, _account_id: AccountId, _status: SyncStatus, _progress: u8) {}

    /// The scheduler lost its store and asks the host to restart it
    fn restart_requested(&self) {}
}

/// Handle returned by [`ObserverList::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registered observers with best-effort fan-out
///
/// A panicking observer is logged and skipped; the rest still hear the event.
#[derive(Default)]
pub struct ObserverList {
    observers: RwLock<Vec<(ObserverId, Arc<dyn SyncObserver>)>>,
    next_id: AtomicU64,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn SyncObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.observers.write().push((id, observer));
        id
    }

    /// Returns whether the observer was registered
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    pub fn mailbox_status(&self, mailbox_id: MailboxId, status: SyncStatus, progress: u8) {
        self.broadcast("sync_mailbox_status", |o| {
            o.sync_mailbox_status(mailbox_id, status, progress)
        });
    }

    pub fn mailbox_list_status(&self, account_id: AccountId, status: SyncStatus, progress: u8) {
        self.broadcast("sync_mailbox_list_status", |o| {
            o.sync_mailbox_list_status(account_id, status, progress)
        });
    }

    pub fn restart_requested(&self) {
        self.broadcast("restart_requested", |o| o.restart_requested());
    }

    fn broadcast(&self, event: &str, call: impl Fn(&dyn SyncObserver)) {
        // Snapshot so observers may register or unregister from a callback
        let observers: Vec<_> = self
            .observers
            .read()
            .iter()
            .map(|(id, o)| (*id, o.clone()))
            .collect();
        for (id, observer) in observers {
            if catch_unwind(AssertUnwindSafe(|| call(observer.as_ref()))).is_err() {
                error!("Observer {:?} panicked during {}", id, event);
            }
        }
    }
}
