//! Per-mailbox failure records and backoff holds

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::timing::{add_duration, next_hold_delay};
use crate::error::SyncErrorReason;
use crate::models::{AccountId, MailboxId};

/// The most recent failure of a mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncError {
    pub reason: SyncErrorReason,
    pub account_id: AccountId,
    /// Never auto-retried; only an explicit release clears it
    pub fatal: bool,
    /// Current backoff step
    pub hold_delay: Duration,
    /// No automatic start before this time
    pub hold_end_time: Option<DateTime<Utc>>,
}

impl SyncError {
    fn new(
        reason: SyncErrorReason,
        account_id: AccountId,
        fatal: bool,
        initial_delay: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            reason,
            account_id,
            fatal: fatal || !reason.is_retryable(),
            hold_delay: initial_delay,
            hold_end_time: Some(add_duration(now, initial_delay)),
        }
    }

    /// Double the hold (up to `max`) and restart the window at `now`
    pub fn escalate(&mut self, now: DateTime<Utc>, max: Duration) {
        self.hold_delay = next_hold_delay(self.hold_delay, max);
        self.hold_end_time = Some(add_duration(now, self.hold_delay));
    }

    /// Whether the hold still blocks scheduling at `now`
    pub fn is_holding(&self, now: DateTime<Utc>) -> bool {
        self.fatal || self.hold_end_time.is_some_and(|end| now < end)
    }
}

/// Failure records keyed by mailbox
#[derive(Debug)]
pub struct SyncErrorTable {
    entries: HashMap<MailboxId, SyncError>,
    initial_delay: Duration,
    max_delay: Duration,
}

impl SyncErrorTable {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            initial_delay,
            max_delay,
        }
    }

    /// Record a failure
    ///
    /// A repeat of the same transient reason escalates the existing hold.
    /// A non-retryable reason always leaves a fatal entry behind.
    pub fn record(
        &mut self,
        mailbox_id: MailboxId,
        account_id: AccountId,
        reason: SyncErrorReason,
        fatal: bool,
        now: DateTime<Utc>,
    ) -> &SyncError {
        let (initial, max) = (self.initial_delay, self.max_delay);
        self.entries
            .entry(mailbox_id)
            .and_modify(|existing| {
                if existing.reason == reason && reason.is_retryable() {
                    existing.escalate(now, max);
                } else {
                    *existing = SyncError::new(reason, account_id, fatal, initial, now);
                }
            })
            .or_insert_with(|| SyncError::new(reason, account_id, fatal, initial, now))
    }

    /// Clear every entry with `reason`, optionally only for one account
    ///
    /// Returns whether anything was cleared.
    pub fn release(&mut self, reason: SyncErrorReason, account_id: Option<AccountId>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            !(e.reason == reason && account_id.is_none_or(|id| id == e.account_id))
        });
        self.entries.len() != before
    }

    /// Lift every hold of an account but keep the entries
    ///
    /// Used when the account's server changes: the next failure keeps
    /// escalating from where it was.
    pub fn unhold_account(&mut self, account_id: AccountId) {
        for error in self.entries.values_mut().filter(|e| e.account_id == account_id) {
            error.fatal = false;
            error.hold_end_time = None;
        }
    }

    /// Drop the hold window of an entry whose hold has expired
    pub fn clear_hold_end(&mut self, mailbox_id: MailboxId) {
        if let Some(error) = self.entries.get_mut(&mailbox_id) {
            error.hold_end_time = None;
        }
    }

    pub fn remove(&mut self, mailbox_id: MailboxId) -> Option<SyncError> {
        self.entries.remove(&mailbox_id)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(MailboxId, &SyncError) -> bool) {
        self.entries.retain(|id, e| keep(*id, e));
    }

    pub fn get(&self, mailbox_id: MailboxId) -> Option<&SyncError> {
        self.entries.get(&mailbox_id)
    }

    pub fn is_fatal(&self, mailbox_id: MailboxId) -> bool {
        self.entries.get(&mailbox_id).is_some_and(|e| e.fatal)
    }

    pub fn hold_end_time(&self, mailbox_id: MailboxId) -> Option<DateTime<Utc>> {
        self.entries.get(&mailbox_id).and_then(|e| e.hold_end_time)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MailboxId, &SyncError)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }
}
