//! Storage trait definitions

use std::sync::Arc;

use anyhow::Result;

use crate::models::{Account, AccountId, Mailbox, MailboxId, MailboxType, SyncInterval};

/// What changed in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    /// An account was added, removed or edited
    Accounts,
    /// A mailbox was added, removed or edited
    Mailboxes,
    /// The outgoing queue of an outbox changed
    Outgoing(MailboxId),
}

/// Receives change notifications from a [`SyncStore`]
///
/// Called after the store has released its own locks, on the thread that
/// made the change.
pub trait StoreListener: Send + Sync {
    fn on_store_change(&self, change: StoreChange);
}

/// Selects mailboxes from [`SyncStore::list_syncable_mailboxes`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxFilter {
    /// Only mailboxes of this account
    pub account_id: Option<AccountId>,
    /// Only mailboxes of this kind
    pub kind: Option<MailboxType>,
    /// Include mailboxes whose interval is `Never`
    pub include_never: bool,
}

impl MailboxFilter {
    /// Every outbox, plus every other mailbox with an interval other than `Never`
    pub fn syncable() -> Self {
        Self::default()
    }

    /// Restrict to one account
    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Restrict to one mailbox kind
    pub fn with_kind(mut self, kind: MailboxType) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Also return mailboxes that never sync
    pub fn including_never(mut self) -> Self {
        self.include_never = true;
        self
    }

    pub fn matches(&self, mailbox: &Mailbox) -> bool {
        if !self.include_never
            && mailbox.interval == SyncInterval::Never
            && mailbox.kind != MailboxType::Outbox
        {
            return false;
        }
        if self.account_id.is_some_and(|id| id != mailbox.account_id) {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != mailbox.kind) {
            return false;
        }
        true
    }
}

/// Trait for the account/mailbox store the scheduler reads from
///
/// Implementations return [`crate::ProviderUnavailableError`] inside the
/// `anyhow::Error` when the store cannot be reached at all; every other error
/// is treated as affecting only the item being read.
pub trait SyncStore: Send + Sync {
    /// List every account, ordered by id
    fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Get an account by ID
    fn get_account(&self, id: AccountId) -> Result<Option<Account>>;

    /// List mailboxes matching the filter, ordered by id
    fn list_syncable_mailboxes(&self, filter: &MailboxFilter) -> Result<Vec<Mailbox>>;

    /// Get a mailbox by ID
    fn get_mailbox(&self, id: MailboxId) -> Result<Option<Mailbox>>;

    /// Whether an outbox has queued messages that have not failed to send
    fn has_sendable_items(&self, outbox: MailboxId) -> Result<bool>;

    /// Clear the send-failed mark on every queued message of an outbox
    fn reset_send_failures(&self, outbox: MailboxId) -> Result<()>;

    /// Set the interval of an account's inbox
    fn update_inbox_interval(&self, account_id: AccountId, interval: SyncInterval) -> Result<()>;

    /// Register for change notifications
    fn subscribe(&self, listener: Arc<dyn StoreListener>);

    // === Mutation helpers ===

    /// Insert or update an account
    fn upsert_account(&self, account: Account) -> Result<()>;

    /// Delete an account and its mailboxes
    fn delete_account(&self, id: AccountId) -> Result<()>;

    /// Insert or update a mailbox
    fn upsert_mailbox(&self, mailbox: Mailbox) -> Result<()>;

    /// Delete a mailbox and its outgoing queue
    fn delete_mailbox(&self, id: MailboxId) -> Result<()>;

    /// Queue a message for sending from an outbox
    fn queue_outgoing(&self, outbox: MailboxId, message_id: i64) -> Result<()>;

    /// Mark a queued message as failed to send
    fn mark_send_failed(&self, outbox: MailboxId, message_id: i64) -> Result<()>;

    /// Remove a message from the outgoing queue (sent or discarded)
    fn remove_outgoing(&self, outbox: MailboxId, message_id: i64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(id: i64, account: i64, kind: MailboxType, interval: SyncInterval) -> Mailbox {
        Mailbox::new(MailboxId::new(id), AccountId::new(account), kind, "box").with_interval(interval)
    }

    #[test]
    fn test_syncable_filter_skips_never() {
        let filter = MailboxFilter::syncable();
        assert!(filter.matches(&mailbox(1, 1, MailboxType::Inbox, SyncInterval::Push)));
        assert!(!filter.matches(&mailbox(2, 1, MailboxType::Inbox, SyncInterval::Never)));
        assert!(filter.matches(&mailbox(3, 1, MailboxType::Outbox, SyncInterval::Never)));
        assert!(filter.including_never().matches(&mailbox(2, 1, MailboxType::Inbox, SyncInterval::Never)));
    }

    #[test]
    fn test_filter_by_account_and_kind() {
        let filter = MailboxFilter::syncable()
            .with_account(AccountId::new(2))
            .with_kind(MailboxType::Inbox);
        assert!(filter.matches(&mailbox(1, 2, MailboxType::Inbox, SyncInterval::Minutes(5))));
        assert!(!filter.matches(&mailbox(1, 1, MailboxType::Inbox, SyncInterval::Minutes(5))));
        assert!(!filter.matches(&mailbox(1, 2, MailboxType::Outbox, SyncInterval::Minutes(5))));
    }
}
