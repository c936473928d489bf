//! Authoritative map of running workers
//!
//! The registry owns one [`WorkerHandle`] per mailbox with a sync in flight.
//! Insertion is check-and-insert under the caller's lock, so a second start
//! for the same mailbox fails instead of spawning a duplicate.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::alarm::OwnerKey;
use super::wake_lock::WakeLock;
use super::worker::{StopToken, SyncWorker, WorkerContext, WorkerFactory, WorkerLink};
use crate::error::{ExitOutcome, SchedulerError};
use crate::models::{
    Account, AccountId, Mailbox, MailboxId, MailboxType, SyncReason, SyncRequest,
};

/// Identifies one particular run of a mailbox's worker
///
/// Completion reports carry the token so a late report from a released
/// worker cannot remove its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LivenessToken(u64);

/// Reported by a worker thread when `run` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub mailbox_id: MailboxId,
    pub token: LivenessToken,
    pub outcome: ExitOutcome,
    pub reason: SyncReason,
}

/// A running worker
pub struct WorkerHandle {
    pub mailbox_id: MailboxId,
    pub kind: MailboxType,
    pub account: Account,
    pub reason: SyncReason,
    /// Out-of-band wake requested for this worker
    pub request_time: Option<DateTime<Utc>>,
    pub token: LivenessToken,
    pub started_at: DateTime<Utc>,
    pub stop_requested_at: Option<DateTime<Utc>>,
    worker: Arc<dyn SyncWorker>,
    stop: StopToken,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Whether the worker thread is still running
    pub fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }

    pub fn worker(&self) -> &Arc<dyn SyncWorker> {
        &self.worker
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread.thread().name()
    }
}

/// Everything needed to start one worker
pub struct StartRequest<'a> {
    pub mailbox: &'a Mailbox,
    pub account: &'a Account,
    pub reason: SyncReason,
    pub request: Option<SyncRequest>,
    pub now: DateTime<Utc>,
}

/// Mailbox -> running worker
pub struct WorkerRegistry {
    workers: BTreeMap<MailboxId, WorkerHandle>,
    next_token: u64,
    wake_lock: Arc<WakeLock>,
}

impl WorkerRegistry {
    pub fn new(wake_lock: Arc<WakeLock>) -> Self {
        Self {
            workers: BTreeMap::new(),
            next_token: 0,
            wake_lock,
        }
    }

    /// Create and spawn a worker for the mailbox
    ///
    /// Fails with [`SchedulerError::AlreadyRunning`] if the mailbox already
    /// has one. `on_exit` runs on the worker thread after `run` returns; a
    /// worker that panics never reports and is reaped as a dead thread.
    pub fn start(
        &mut self,
        start: StartRequest<'_>,
        factory: &dyn WorkerFactory,
        link: Weak<dyn WorkerLink>,
        on_exit: impl FnOnce(WorkerExit) + Send + 'static,
    ) -> Result<LivenessToken, SchedulerError> {
        let mailbox_id = start.mailbox.id;
        if self.workers.contains_key(&mailbox_id) {
            return Err(SchedulerError::AlreadyRunning(mailbox_id));
        }

        self.next_token += 1;
        let token = LivenessToken(self.next_token);
        let stop = StopToken::new();
        let ctx = WorkerContext::new(
            start.mailbox.clone(),
            start.account.clone(),
            start.reason,
            stop.clone(),
            link,
        );
        let worker = factory
            .create(ctx, start.request)
            .map_err(SchedulerError::Worker)?;

        let reason = start.reason;
        let thread_worker = worker.clone();
        let thread = std::thread::Builder::new()
            .name(start.mailbox.thread_name(&start.account.display_name))
            .spawn(move || {
                let outcome = thread_worker.run();
                on_exit(WorkerExit {
                    mailbox_id,
                    token,
                    outcome,
                    reason,
                });
            })?;

        info!(
            "Starting thread for {} ({:?})",
            start.mailbox.thread_name(&start.account.display_name),
            reason
        );
        self.workers.insert(
            mailbox_id,
            WorkerHandle {
                mailbox_id,
                kind: start.mailbox.kind,
                account: start.account.clone(),
                reason,
                request_time: None,
                token,
                started_at: start.now,
                stop_requested_at: None,
                worker,
                stop,
                thread,
            },
        );
        self.wake_lock.acquire(OwnerKey::Mailbox(mailbox_id));
        Ok(token)
    }

    /// Ask a worker to stop: cooperative flag, then forced interrupt
    ///
    /// Idempotent. The handle stays registered until the worker reports or
    /// is released. Returns whether a stop was issued now.
    pub fn stop(&mut self, mailbox_id: MailboxId, now: DateTime<Utc>) -> bool {
        let Some(handle) = self.workers.get_mut(&mailbox_id) else {
            return false;
        };
        if handle.stop_requested_at.is_some() {
            return false;
        }
        debug!("Stopping worker for mailbox {}", mailbox_id);
        handle.stop.cancel();
        handle.worker.request_stop();
        handle.stop_requested_at = Some(now);
        self.wake_lock.release(OwnerKey::Mailbox(mailbox_id));
        true
    }

    /// Remove a worker unconditionally
    pub fn release(&mut self, mailbox_id: MailboxId) -> Option<WorkerHandle> {
        let handle = self.workers.remove(&mailbox_id)?;
        handle.stop.cancel();
        self.wake_lock.release(OwnerKey::Mailbox(mailbox_id));
        Some(handle)
    }

    /// Remove a worker only if `token` identifies the current run
    pub fn release_if_current(
        &mut self,
        mailbox_id: MailboxId,
        token: LivenessToken,
    ) -> Option<WorkerHandle> {
        if self.workers.get(&mailbox_id)?.token != token {
            return None;
        }
        self.release(mailbox_id)
    }

    /// Attach (or move) an out-of-band wake to a running worker
    pub fn request_wake(&mut self, mailbox_id: MailboxId, at: DateTime<Utc>) -> bool {
        match self.workers.get_mut(&mailbox_id) {
            Some(handle) => {
                handle.request_time = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn clear_wake(&mut self, mailbox_id: MailboxId) {
        if let Some(handle) = self.workers.get_mut(&mailbox_id) {
            handle.request_time = None;
        }
    }

    pub fn set_reason(&mut self, mailbox_id: MailboxId, reason: SyncReason) -> bool {
        match self.workers.get_mut(&mailbox_id) {
            Some(handle) => {
                handle.reason = reason;
                true
            }
            None => false,
        }
    }

    /// Refresh the account snapshot held by the account's workers
    pub fn update_account(&mut self, account: &Account) {
        for handle in self.workers.values_mut().filter(|h| h.account.id == account.id) {
            handle.account = account.clone();
        }
    }

    pub fn get(&self, mailbox_id: MailboxId) -> Option<&WorkerHandle> {
        self.workers.get(&mailbox_id)
    }

    pub fn contains(&self, mailbox_id: MailboxId) -> bool {
        self.workers.contains_key(&mailbox_id)
    }

    pub fn is_alive(&self, mailbox_id: MailboxId) -> bool {
        self.workers.get(&mailbox_id).is_some_and(WorkerHandle::is_alive)
    }

    pub fn ids(&self) -> Vec<MailboxId> {
        self.workers.keys().copied().collect()
    }

    /// Running mailboxes of one account
    pub fn ids_for_account(&self, account_id: AccountId) -> Vec<MailboxId> {
        self.workers
            .values()
            .filter(|h| h.account.id == account_id)
            .map(|h| h.mailbox_id)
            .collect()
    }

    /// The running account-root worker of an account, if any
    pub fn account_root(&self, account_id: AccountId) -> Option<&WorkerHandle> {
        self.workers
            .values()
            .find(|h| h.account.id == account_id && h.kind == MailboxType::AccountRoot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
