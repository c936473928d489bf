//! In-memory storage implementation
//!
//! Used by tests and the daemon's fixture mode. Can be switched into an
//! "unavailable" state to exercise the scheduler's provider-failure path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use parking_lot::RwLock;

use super::traits::{MailboxFilter, StoreChange, StoreListener, SyncStore};
use crate::error::ProviderUnavailableError;
use crate::models::{Account, AccountId, Mailbox, MailboxId, MailboxType, SyncInterval};

/// A message waiting in an outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutgoingEntry {
    send_failed: bool,
}

/// In-memory implementation of SyncStore
///
/// BTreeMaps keep listing order stable by id.
pub struct InMemorySyncStore {
    accounts: RwLock<BTreeMap<AccountId, Account>>,
    mailboxes: RwLock<BTreeMap<MailboxId, Mailbox>>,
    /// Outbox id -> message id -> entry
    outgoing: RwLock<HashMap<MailboxId, BTreeMap<i64, OutgoingEntry>>>,
    listeners: RwLock<Vec<Arc<dyn StoreListener>>>,
    unavailable: AtomicBool,
}

impl InMemorySyncStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            mailboxes: RwLock::new(BTreeMap::new()),
            outgoing: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every read fail with [`ProviderUnavailableError`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderUnavailableError.into());
        }
        Ok(())
    }

    fn notify(&self, change: StoreChange) {
        // Snapshot so listeners can call back into the store
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.on_store_change(change);
        }
    }
}

impl Default for InMemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore for InMemorySyncStore {
    fn list_accounts(&self) -> Result<Vec<Account>> {
        self.check_available()?;
        Ok(self.accounts.read().values().cloned().collect())
    }

    fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        self.check_available()?;
        Ok(self.accounts.read().get(&id).cloned())
    }

    fn list_syncable_mailboxes(&self, filter: &MailboxFilter) -> Result<Vec<Mailbox>> {
        self.check_available()?;
        Ok(self
            .mailboxes
            .read()
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    fn get_mailbox(&self, id: MailboxId) -> Result<Option<Mailbox>> {
        self.check_available()?;
        Ok(self.mailboxes.read().get(&id).cloned())
    }

    fn has_sendable_items(&self, outbox: MailboxId) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .outgoing
            .read()
            .get(&outbox)
            .is_some_and(|queue| queue.values().any(|e| !e.send_failed)))
    }

    fn reset_send_failures(&self, outbox: MailboxId) -> Result<()> {
        self.check_available()?;
        {
            let mut outgoing = self.outgoing.write();
            if let Some(queue) = outgoing.get_mut(&outbox) {
                for entry in queue.values_mut() {
                    entry.send_failed = false;
                }
            }
        }
        self.notify(StoreChange::Outgoing(outbox));
        Ok(())
    }

    fn update_inbox_interval(&self, account_id: AccountId, interval: SyncInterval) -> Result<()> {
        self.check_available()?;
        {
            let mut mailboxes = self.mailboxes.write();
            for mailbox in mailboxes
                .values_mut()
                .filter(|m| m.account_id == account_id && m.kind == MailboxType::Inbox)
            {
                mailbox.interval = interval;
            }
        }
        self.notify(StoreChange::Mailboxes);
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn StoreListener>) {
        self.listeners.write().push(listener);
    }

    fn upsert_account(&self, account: Account) -> Result<()> {
        self.check_available()?;
        self.accounts.write().insert(account.id, account);
        self.notify(StoreChange::Accounts);
        Ok(())
    }

    fn delete_account(&self, id: AccountId) -> Result<()> {
        self.check_available()?;
        self.accounts.write().remove(&id);
        let removed: Vec<MailboxId> = {
            let mut mailboxes = self.mailboxes.write();
            let ids: Vec<_> = mailboxes
                .values()
                .filter(|m| m.account_id == id)
                .map(|m| m.id)
                .collect();
            for mailbox_id in &ids {
                mailboxes.remove(mailbox_id);
            }
            ids
        };
        {
            let mut outgoing = self.outgoing.write();
            for mailbox_id in &removed {
                outgoing.remove(mailbox_id);
            }
        }
        self.notify(StoreChange::Accounts);
        self.notify(StoreChange::Mailboxes);
        Ok(())
    }

    fn upsert_mailbox(&self, mailbox: Mailbox) -> Result<()> {
        self.check_available()?;
        self.mailboxes.write().insert(mailbox.id, mailbox);
        self.notify(StoreChange::Mailboxes);
        Ok(())
    }

    fn delete_mailbox(&self, id: MailboxId) -> Result<()> {
        self.check_available()?;
        self.mailboxes.write().remove(&id);
        self.outgoing.write().remove(&id);
        self.notify(StoreChange::Mailboxes);
        Ok(())
    }

    fn queue_outgoing(&self, outbox: MailboxId, message_id: i64) -> Result<()> {
        self.check_available()?;
        self.outgoing
            .write()
            .entry(outbox)
            .or_default()
            .insert(message_id, OutgoingEntry { send_failed: false });
        self.notify(StoreChange::Outgoing(outbox));
        Ok(())
    }

    fn mark_send_failed(&self, outbox: MailboxId, message_id: i64) -> Result<()> {
        self.check_available()?;
        if let Some(entry) = self
            .outgoing
            .write()
            .get_mut(&outbox)
            .and_then(|queue| queue.get_mut(&message_id))
        {
            entry.send_failed = true;
        }
        self.notify(StoreChange::Outgoing(outbox));
        Ok(())
    }

    fn remove_outgoing(&self, outbox: MailboxId, message_id: i64) -> Result<()> {
        self.check_available()?;
        if let Some(queue) = self.outgoing.write().get_mut(&outbox) {
            queue.remove(&message_id);
        }
        self.notify(StoreChange::Outgoing(outbox));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_provider_unavailable;
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<StoreChange>>);

    impl StoreListener for Recorder {
        fn on_store_change(&self, change: StoreChange) {
            self.0.lock().push(change);
        }
    }

    fn seeded_store() -> InMemorySyncStore {
        let store = InMemorySyncStore::new();
        store
            .upsert_account(Account::new(AccountId::new(1), "a@example.com"))
            .unwrap();
        store
            .upsert_mailbox(
                Mailbox::new(MailboxId::new(10), AccountId::new(1), MailboxType::Inbox, "Inbox")
                    .with_interval(SyncInterval::Push),
            )
            .unwrap();
        store
            .upsert_mailbox(
                Mailbox::new(MailboxId::new(11), AccountId::new(1), MailboxType::Outbox, "Outbox")
                    .with_interval(SyncInterval::Minutes(5)),
            )
            .unwrap();
        store
            .upsert_mailbox(Mailbox::new(
                MailboxId::new(12),
                AccountId::new(1),
                MailboxType::Trash,
                "Trash",
            ))
            .unwrap();
        store
    }

    #[test]
    fn test_list_syncable_skips_never() {
        let store = seeded_store();
        let ids: Vec<_> = store
            .list_syncable_mailboxes(&MailboxFilter::syncable())
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![MailboxId::new(10), MailboxId::new(11)]);
    }

    #[test]
    fn test_outgoing_queue_sendable() {
        let store = seeded_store();
        let outbox = MailboxId::new(11);
        assert!(!store.has_sendable_items(outbox).unwrap());

        store.queue_outgoing(outbox, 100).unwrap();
        assert!(store.has_sendable_items(outbox).unwrap());

        store.mark_send_failed(outbox, 100).unwrap();
        assert!(!store.has_sendable_items(outbox).unwrap());

        store.reset_send_failures(outbox).unwrap();
        assert!(store.has_sendable_items(outbox).unwrap());

        store.remove_outgoing(outbox, 100).unwrap();
        assert!(!store.has_sendable_items(outbox).unwrap());
    }

    #[test]
    fn test_update_inbox_interval() {
        let store = seeded_store();
        store
            .update_inbox_interval(AccountId::new(1), SyncInterval::Minutes(15))
            .unwrap();
        let inbox = store.get_mailbox(MailboxId::new(10)).unwrap().unwrap();
        assert_eq!(inbox.interval, SyncInterval::Minutes(15));
        let outbox = store.get_mailbox(MailboxId::new(11)).unwrap().unwrap();
        assert_eq!(outbox.interval, SyncInterval::Minutes(5));
    }

    #[test]
    fn test_delete_account_removes_mailboxes() {
        let store = seeded_store();
        store.delete_account(AccountId::new(1)).unwrap();
        assert!(store.get_account(AccountId::new(1)).unwrap().is_none());
        assert!(store.get_mailbox(MailboxId::new(10)).unwrap().is_none());
        assert!(
            store
                .list_syncable_mailboxes(&MailboxFilter::syncable().including_never())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_listeners_notified() {
        let store = InMemorySyncStore::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        store.subscribe(recorder.clone());

        store
            .upsert_account(Account::new(AccountId::new(1), "a@example.com"))
            .unwrap();
        store.queue_outgoing(MailboxId::new(5), 1).unwrap();

        let changes = recorder.0.lock().clone();
        assert_eq!(
            changes,
            vec![StoreChange::Accounts, StoreChange::Outgoing(MailboxId::new(5))]
        );
    }

    #[test]
    fn test_unavailable_store_fails_reads() {
        let store = seeded_store();
        store.set_unavailable(true);
        let err = store.list_accounts().unwrap_err();
        assert!(is_provider_unavailable(&err));

        store.set_unavailable(false);
        assert_eq!(store.list_accounts().unwrap().len(), 1);
    }
}
