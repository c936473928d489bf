//! Shared fixtures for scheduler integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mailsync::models::{
    Account, AccountId, Mailbox, MailboxId, MailboxType, SyncInterval, SyncReason, SyncRequest,
};
use mailsync::{
    AccountFlags, ExitOutcome, SyncErrorReason, SyncObserver, SyncStatus, SyncWorker,
    WorkerContext, WorkerFactory,
};
use mailsync::sync::CredentialAuthority;
use parking_lot::Mutex;

pub const ACCOUNT: AccountId = AccountId(1);

/// What a fake worker does when run
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Block until stopped, then report `Done`
    Block,
    /// Return the outcome right away
    Exit(ExitOutcome),
    /// Panic inside `run`
    Panic,
    /// Keep working for a while regardless of stop requests
    IgnoreStop(Duration),
}

/// Counters shared by a factory and every worker it made
#[derive(Default)]
pub struct Stats {
    pub created: Mutex<Vec<(MailboxId, SyncReason)>>,
    pub requests: Mutex<Vec<(MailboxId, SyncRequest)>>,
    pub alerts: AtomicUsize,
    pub resets: AtomicUsize,
}

impl Stats {
    pub fn created_for(&self, mailbox_id: MailboxId) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|(id, _)| *id == mailbox_id)
            .count()
    }

    pub fn reasons_for(&self, mailbox_id: MailboxId) -> Vec<SyncReason> {
        self.created
            .lock()
            .iter()
            .filter(|(id, _)| *id == mailbox_id)
            .map(|(_, reason)| *reason)
            .collect()
    }
}

struct FakeWorker {
    ctx: WorkerContext,
    behavior: Behavior,
    stats: Arc<Stats>,
}

impl SyncWorker for FakeWorker {
    fn run(&self) -> ExitOutcome {
        match self.behavior {
            Behavior::Block => {
                self.ctx.run_awake();
                while self.ctx.sleep(Duration::from_secs(60)) {}
                ExitOutcome::Done
            }
            Behavior::Exit(outcome) => outcome,
            Behavior::Panic => panic!("worker for {} crashed", self.ctx.mailbox.display_name),
            Behavior::IgnoreStop(busy) => {
                thread::sleep(busy);
                ExitOutcome::Done
            }
        }
    }

    fn request_stop(&self) {}

    fn alert(&self, request: Option<SyncRequest>) -> bool {
        self.stats.alerts.fetch_add(1, Ordering::SeqCst);
        if let Some(request) = request {
            self.stats.requests.lock().push((self.ctx.mailbox_id(), request));
        }
        true
    }

    fn reset(&self) {
        self.stats.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory that hands out scripted workers; unscripted runs block
#[derive(Default)]
pub struct FakeFactory {
    script: Mutex<HashMap<MailboxId, VecDeque<Behavior>>>,
    pub stats: Arc<Stats>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the behavior of the next run of a mailbox
    pub fn script(&self, mailbox_id: MailboxId, behavior: Behavior) {
        self.script
            .lock()
            .entry(mailbox_id)
            .or_default()
            .push_back(behavior);
    }
}

impl WorkerFactory for FakeFactory {
    fn create(
        &self,
        ctx: WorkerContext,
        request: Option<SyncRequest>,
    ) -> anyhow::Result<Arc<dyn SyncWorker>> {
        let mailbox_id = ctx.mailbox_id();
        let behavior = self
            .script
            .lock()
            .get_mut(&mailbox_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::Block);
        self.stats.created.lock().push((mailbox_id, ctx.reason));
        if let Some(request) = request {
            self.stats.requests.lock().push((mailbox_id, request));
        }
        Ok(Arc::new(FakeWorker {
            ctx,
            behavior,
            stats: self.stats.clone(),
        }))
    }
}

/// Observer that records every callback
#[derive(Default)]
pub struct RecordingObserver {
    pub statuses: Mutex<Vec<(MailboxId, SyncStatus, u8)>>,
    pub list_statuses: Mutex<Vec<(AccountId, SyncStatus, u8)>>,
    pub restarts: AtomicUsize,
}

impl SyncObserver for RecordingObserver {
    fn sync_mailbox_status(&self, mailbox_id: MailboxId, status: SyncStatus, progress: u8) {
        self.statuses.lock().push((mailbox_id, status, progress));
    }

    fn sync_mailbox_list_status(&self, account_id: AccountId, status: SyncStatus, progress: u8) {
        self.list_statuses.lock().push((account_id, status, progress));
    }

    fn restart_requested(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Authority that records every callback
#[derive(Default)]
pub struct RecordingAuthority {
    pub login_failed: Mutex<Vec<AccountId>>,
    pub login_succeeded: Mutex<Vec<AccountId>>,
    pub fatal: Mutex<Vec<(AccountId, SyncErrorReason)>>,
}

impl CredentialAuthority for RecordingAuthority {
    fn on_login_failed(&self, account_id: AccountId) {
        self.login_failed.lock().push(account_id);
    }

    fn on_login_succeeded(&self, account_id: AccountId) {
        self.login_succeeded.lock().push(account_id);
    }

    fn on_fatal_error(&self, account_id: AccountId, reason: SyncErrorReason) {
        self.fatal.lock().push((account_id, reason));
    }
}

pub fn account() -> Account {
    Account::new(ACCOUNT, "user@example.com").with_display_name("Work")
}

pub fn held_account(flags: AccountFlags) -> Account {
    account().with_flags(flags)
}

pub fn mailbox(id: i64, kind: MailboxType, name: &str, interval: SyncInterval) -> Mailbox {
    Mailbox::new(MailboxId::new(id), ACCOUNT, kind, name).with_interval(interval)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
