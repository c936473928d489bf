//! Scheduler-side copy of the store's accounts

use std::collections::BTreeMap;

use crate::models::{Account, AccountId};

/// What changed between the cached accounts and a fresh store listing
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AccountChanges {
    /// New to the cache
    pub added: Vec<AccountId>,
    /// Gone from the store (and not mid-setup)
    pub removed: Vec<Account>,
    /// Inbox interval or lookback changed; carries the fresh account
    pub interval_changed: Vec<Account>,
    /// Security hold was lifted
    pub security_released: Vec<AccountId>,
    /// Every account still present, fresh from the store
    pub updated: Vec<Account>,
}

impl AccountChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.interval_changed.is_empty()
            && self.security_released.is_empty()
    }
}

/// Read-mostly account cache, refreshed on store change notifications
#[derive(Debug, Default)]
pub struct AccountCache {
    accounts: BTreeMap<AccountId, Account>,
}

impl AccountCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(&id)
    }

    pub fn insert(&mut self, account: Account) {
        self.accounts.insert(account.id, account);
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Replace the cache with `fresh` and report what changed
    ///
    /// An account that disappears while its setup is incomplete stays cached:
    /// it is still being created, not deleted.
    pub fn reconcile(&mut self, fresh: Vec<Account>) -> AccountChanges {
        let mut changes = AccountChanges::default();
        let mut fresh: BTreeMap<AccountId, Account> =
            fresh.into_iter().map(|a| (a.id, a)).collect();

        let cached_ids: Vec<AccountId> = self.accounts.keys().copied().collect();
        for id in cached_ids {
            let Some(cached) = self.accounts.get(&id) else {
                continue;
            };
            match fresh.remove(&id) {
                None => {
                    if !cached.flags.incomplete {
                        if let Some(account) = self.accounts.remove(&id) {
                            changes.removed.push(account);
                        }
                    }
                }
                Some(updated) => {
                    if cached.sync_interval != updated.sync_interval
                        || cached.sync_lookback_days != updated.sync_lookback_days
                    {
                        changes.interval_changed.push(updated.clone());
                    }
                    if cached.on_security_hold() && !updated.on_security_hold() {
                        changes.security_released.push(id);
                    }
                    changes.updated.push(updated.clone());
                    self.accounts.insert(id, updated);
                }
            }
        }

        for (id, account) in fresh {
            changes.added.push(id);
            changes.updated.push(account.clone());
            self.accounts.insert(id, account);
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountFlags, SyncInterval};

    fn account(id: i64) -> Account {
        Account::new(AccountId::new(id), format!("{id}@example.com"))
    }

    #[test]
    fn test_reconcile_detects_added_and_removed() {
        let mut cache = AccountCache::new();
        cache.reconcile(vec![account(1), account(2)]);

        let changes = cache.reconcile(vec![account(2), account(3)]);
        assert_eq!(changes.added, vec![AccountId::new(3)]);
        assert_eq!(changes.removed.len(), 1);
        assert_eq!(changes.removed[0].id, AccountId::new(1));
        assert!(cache.get(AccountId::new(1)).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_reconcile_keeps_incomplete_accounts() {
        let mut cache = AccountCache::new();
        let incomplete = account(1).with_flags(AccountFlags {
            incomplete: true,
            ..Default::default()
        });
        cache.reconcile(vec![incomplete]);

        let changes = cache.reconcile(vec![]);
        assert!(changes.removed.is_empty());
        assert!(cache.get(AccountId::new(1)).is_some());
    }

    #[test]
    fn test_reconcile_interval_and_security_changes() {
        let mut cache = AccountCache::new();
        let held = account(1).with_flags(AccountFlags {
            security_hold: true,
            ..Default::default()
        });
        cache.reconcile(vec![held, account(2)]);

        let changes = cache.reconcile(vec![
            account(1),
            account(2).with_sync_interval(SyncInterval::Minutes(15)),
        ]);
        assert_eq!(changes.security_released, vec![AccountId::new(1)]);
        assert_eq!(changes.interval_changed.len(), 1);
        assert_eq!(changes.interval_changed[0].sync_interval, SyncInterval::Minutes(15));
        assert_eq!(
            cache.get(AccountId::new(2)).unwrap().sync_interval,
            SyncInterval::Minutes(15)
        );
        assert!(!changes.is_empty());
    }

    #[test]
    fn test_reconcile_unchanged_is_empty() {
        let mut cache = AccountCache::new();
        cache.reconcile(vec![account(1)]);
        let changes = cache.reconcile(vec![account(1)]);
        assert!(changes.is_empty());
        assert_eq!(changes.updated.len(), 1);
    }
}
