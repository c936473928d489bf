//! Process-wide keep-awake resource
//!
//! The host resource is acquired when the first owner takes a hold and
//! released when the last one lets go.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::alarm::OwnerKey;

/// Host facility that keeps the device awake
pub trait KeepAwake: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Host without a sleep state
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopKeepAwake;

impl KeepAwake for NoopKeepAwake {
    fn acquire(&self) {}
    fn release(&self) {}
}

/// Reference-counted wake hold keyed by owner
pub struct WakeLock {
    holders: Mutex<BTreeSet<OwnerKey>>,
    host: Arc<dyn KeepAwake>,
}

impl WakeLock {
    pub fn new(host: Arc<dyn KeepAwake>) -> Self {
        Self {
            holders: Mutex::new(BTreeSet::new()),
            host,
        }
    }

    /// Take a hold for `key`; idempotent
    pub fn acquire(&self, key: OwnerKey) {
        let mut holders = self.holders.lock();
        let was_idle = holders.is_empty();
        if holders.insert(key) && was_idle {
            debug!("Wake lock acquired by {}", key);
            self.host.acquire();
        }
    }

    /// Drop the hold of `key`; idempotent
    pub fn release(&self, key: OwnerKey) {
        let mut holders = self.holders.lock();
        if holders.remove(&key) && holders.is_empty() {
            debug!("Wake lock released by {}", key);
            self.host.release();
        }
    }

    pub fn is_held(&self) -> bool {
        !self.holders.lock().is_empty()
    }

    pub fn is_held_by(&self, key: OwnerKey) -> bool {
        self.holders.lock().contains(&key)
    }

    pub fn holders(&self) -> Vec<OwnerKey> {
        self.holders.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MailboxId;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Default)]
    struct CountingHost {
        held: AtomicI32,
        transitions: AtomicI32,
    }

    impl KeepAwake for CountingHost {
        fn acquire(&self) {
            self.held.fetch_add(1, Ordering::SeqCst);
            self.transitions.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self) {
            self.held.fetch_sub(1, Ordering::SeqCst);
            self.transitions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_host_held_while_any_owner_holds() {
        let host = Arc::new(CountingHost::default());
        let lock = WakeLock::new(host.clone());
        let mailbox = OwnerKey::Mailbox(MailboxId::new(1));

        lock.acquire(OwnerKey::Scheduler);
        lock.acquire(mailbox);
        lock.acquire(mailbox);
        assert_eq!(host.held.load(Ordering::SeqCst), 1);

        lock.release(OwnerKey::Scheduler);
        assert!(lock.is_held());
        assert!(lock.is_held_by(mailbox));

        lock.release(mailbox);
        lock.release(mailbox);
        assert!(!lock.is_held());
        assert_eq!(host.held.load(Ordering::SeqCst), 0);
        assert_eq!(host.transitions.load(Ordering::SeqCst), 2);
    }
}
