//! The sync scheduler
//!
//! One loop thread decides when each mailbox syncs. Every input (store
//! changes, network changes, explicit requests, alarms and worker
//! completions) funnels into [`Scheduler::kick`], which wakes the loop to
//! run an evaluation pass over all mailboxes and compute its next sleep.
//!
//! All scheduling state (running workers, failure holds, cached accounts)
//! sits behind one coarse lock. Observer and authority callbacks are queued
//! while the lock is held and delivered after it is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use super::account_cache::AccountCache;
use super::alarm::{AlarmProvider, AlarmSet, AlarmTarget, NoopAlarmProvider, OwnerKey};
use super::authority::{CredentialAuthority, NoopAuthority};
use super::connectivity::{ConnectivityGate, GateWait, NetworkInfo};
use super::error_table::{SyncError, SyncErrorTable};
use super::observer::{ObserverId, ObserverList, SyncObserver, SyncStatus};
use super::registry::{StartRequest, WorkerExit, WorkerRegistry};
use super::timing::{
    IntervalDue, RequestWait, WaitBound, add_duration, interval_due, plan_sleep, request_wait,
    time_until,
};
use super::wake_lock::{KeepAwake, NoopKeepAwake, WakeLock};
use super::worker::{WorkerFactory, WorkerLink};
use crate::config::SchedulerConfig;
use crate::error::{ExitOutcome, SchedulerError, SyncErrorReason};
use crate::models::{
    Account, AccountId, Mailbox, MailboxId, MailboxType, SyncInterval, SyncReason, SyncRequest,
};
use crate::storage::{MailboxFilter, StoreChange, StoreListener, SyncStore};

/// Extra time on the scheduler alarm while waiting for the network
const CONNECTIVITY_ALARM_SLACK: Duration = Duration::from_secs(5);

const LOOP_THREAD_NAME: &str = "SyncScheduler";

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Constructed, loop not started
    Idle,
    /// Blocked until the network comes back
    AwaitingConnectivity,
    /// Running an evaluation pass
    Evaluating,
    /// Waiting for the next pass or a kick
    Sleeping,
    /// Stopped for good
    Shutdown,
}

/// Whether a mailbox is available as a push target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    Ok,
    /// A worker is already running
    Running,
    /// Held back by a transient error
    Waiting,
    /// Held back by a fatal error
    Unable,
}

/// Callback queued under the sync lock, delivered after it is released
enum Notice {
    MailboxStatus(MailboxId, SyncStatus, u8),
    ListStatus(AccountId, SyncStatus, u8),
    LoginFailed(AccountId),
    LoginSucceeded(AccountId),
    FatalError(AccountId, SyncErrorReason),
}

impl Notice {
    /// Status of a sync; the account root reports on the folder list
    fn status(
        mailbox_id: MailboxId,
        kind: MailboxType,
        account_id: AccountId,
        status: SyncStatus,
        progress: u8,
    ) -> Self {
        if kind == MailboxType::AccountRoot {
            Notice::ListStatus(account_id, status, progress)
        } else {
            Notice::MailboxStatus(mailbox_id, status, progress)
        }
    }
}

struct SyncState {
    registry: WorkerRegistry,
    errors: SyncErrorTable,
    accounts: AccountCache,
    notices: Vec<Notice>,
}

struct Inner {
    me: Weak<Inner>,
    config: SchedulerConfig,
    store: Arc<dyn SyncStore>,
    factory: Arc<dyn WorkerFactory>,
    authority: Arc<dyn CredentialAuthority>,
    gate: Arc<ConnectivityGate>,
    alarms: AlarmSet,
    wake_lock: Arc<WakeLock>,
    observers: ObserverList,
    state: Mutex<SyncState>,
    kicked: Mutex<bool>,
    kick_signal: Condvar,
    stopping: AtomicBool,
    phase: Mutex<SchedulerPhase>,
    background_data: AtomicBool,
    restart_requested: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`Scheduler`]
pub struct SchedulerBuilder {
    store: Arc<dyn SyncStore>,
    factory: Arc<dyn WorkerFactory>,
    config: SchedulerConfig,
    authority: Arc<dyn CredentialAuthority>,
    alarm_provider: Arc<dyn AlarmProvider>,
    keep_awake: Arc<dyn KeepAwake>,
    gate: Arc<ConnectivityGate>,
    background_data: bool,
}

impl SchedulerBuilder {
    /// Set thresholds
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the credential/policy authority
    pub fn with_authority(mut self, authority: Arc<dyn CredentialAuthority>) -> Self {
        self.authority = authority;
        self
    }

    /// Set the alarm provider
    pub fn with_alarm_provider(mut self, provider: Arc<dyn AlarmProvider>) -> Self {
        self.alarm_provider = provider;
        self
    }

    /// Set the host keep-awake resource
    pub fn with_keep_awake(mut self, keep_awake: Arc<dyn KeepAwake>) -> Self {
        self.keep_awake = keep_awake;
        self
    }

    /// Share a connectivity gate with the host
    pub fn with_connectivity(mut self, gate: Arc<ConnectivityGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Initial "background data" setting
    pub fn with_background_data(mut self, enabled: bool) -> Self {
        self.background_data = enabled;
        self
    }

    /// Wire everything together; the loop starts with [`Scheduler::start`]
    pub fn build(self) -> Scheduler {
        let wake_lock = Arc::new(WakeLock::new(self.keep_awake));
        let inner = Arc::new_cyclic(|me: &Weak<Inner>| Inner {
            me: me.clone(),
            state: Mutex::new(SyncState {
                registry: WorkerRegistry::new(wake_lock.clone()),
                errors: SyncErrorTable::new(
                    self.config.initial_hold_delay(),
                    self.config.max_hold_delay(),
                ),
                accounts: AccountCache::new(),
                notices: Vec::new(),
            }),
            config: self.config,
            store: self.store,
            factory: self.factory,
            authority: self.authority,
            gate: self.gate,
            alarms: AlarmSet::new(self.alarm_provider),
            wake_lock,
            observers: ObserverList::new(),
            kicked: Mutex::new(false),
            kick_signal: Condvar::new(),
            stopping: AtomicBool::new(false),
            phase: Mutex::new(SchedulerPhase::Idle),
            background_data: AtomicBool::new(self.background_data),
            restart_requested: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let target: Weak<dyn AlarmTarget> = inner.me.clone();
        inner.alarms.provider().bind(target);
        inner
            .store
            .subscribe(Arc::new(StoreBridge(Arc::downgrade(&inner))));

        Scheduler {
            _owner: Arc::new(LastHandle(Arc::downgrade(&inner))),
            inner,
        }
    }
}

/// Shared by every handle clone; stops the scheduler when the last one drops
struct LastHandle(Weak<Inner>);

impl Drop for LastHandle {
    fn drop(&mut self) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        if !inner.is_stopping() {
            info!("Last scheduler handle dropped; stopping");
            inner.stop();
        }
    }
}

/// Forwards store notifications without keeping the scheduler alive
struct StoreBridge(Weak<Inner>);

impl StoreListener for StoreBridge {
    fn on_store_change(&self, change: StoreChange) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        match change {
            StoreChange::Accounts => {
                if let Err(e) = inner.accounts_changed() {
                    warn!("Failed to reconcile accounts: {}", e);
                }
            }
            StoreChange::Mailboxes => inner.kick("mailbox changed"),
            StoreChange::Outgoing(_) => inner.kick("outbox changed"),
        }
    }
}

/// Handle to the scheduler; clones share the same instance
///
/// Dropping the last clone stops the loop and every worker, like
/// [`Scheduler::stop`].
#[derive(Clone)]
pub struct Scheduler {
    // Declared first so it drops while `inner` is still alive
    _owner: Arc<LastHandle>,
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Start building a scheduler over a store and a worker factory
    pub fn builder(store: Arc<dyn SyncStore>, factory: Arc<dyn WorkerFactory>) -> SchedulerBuilder {
        SchedulerBuilder {
            store,
            factory,
            config: SchedulerConfig::default(),
            authority: Arc::new(NoopAuthority),
            alarm_provider: Arc::new(NoopAlarmProvider),
            keep_awake: Arc::new(NoopKeepAwake),
            gate: Arc::new(ConnectivityGate::default()),
            background_data: true,
        }
    }

    // === Lifecycle ===

    /// Load accounts and start the loop thread
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut thread = self.inner.thread.lock();
        if thread.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }
        if self.inner.is_stopping() {
            return Err(SchedulerError::NotRunning);
        }

        self.inner.refresh_accounts()?;
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || inner.run_loop())?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop the loop and every worker; waits for the loop thread to exit
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Wake the loop for an evaluation pass
    pub fn kick(&self, reason: &str) {
        self.inner.kick(reason);
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.inner.phase.lock()
    }

    /// Whether the loop died because the store became unavailable
    pub fn restart_requested(&self) -> bool {
        self.inner.restart_requested.load(Ordering::SeqCst)
    }

    /// Run one evaluation pass now and return how long the loop would sleep
    pub fn check_mailboxes(&self, now: DateTime<Utc>) -> Result<Duration, SchedulerError> {
        self.inner.check_mailboxes(now)
    }

    // === Environment ===

    pub fn signal_connected(&self, info: NetworkInfo) {
        info!("Network connected (roaming: {})", info.roaming);
        self.inner.gate.signal_connected(info);
        self.inner.kick("connected");
    }

    pub fn signal_disconnected(&self) {
        info!("Network disconnected");
        self.inner.gate.signal_disconnected();
        self.inner.kick("disconnected");
    }

    /// Master switch for automatic mail sync
    pub fn set_background_data(&self, enabled: bool) {
        self.inner.background_data.store(enabled, Ordering::SeqCst);
        if enabled {
            info!("Background data on; restart syncs");
            self.inner.kick("background data on");
        } else {
            info!("Background data off; stop all syncs");
            let now = Utc::now();
            self.inner.with_state(|state| {
                let accounts: Vec<AccountId> = state.accounts.iter().map(|a| a.id).collect();
                for account_id in accounts {
                    self.inner.stop_account_syncs_locked(state, account_id, true, now);
                }
            });
        }
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityGate> {
        &self.inner.gate
    }

    // === Requests ===

    /// Sync a mailbox on request, releasing holds for user requests
    pub fn start_sync(&self, mailbox_id: MailboxId, user_request: bool) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let Some(mailbox) = inner.store.get_mailbox(mailbox_id).map_err(SchedulerError::from_store)?
        else {
            debug!("start_sync for unknown mailbox {}", mailbox_id);
            return Ok(());
        };
        let Some(account) = inner
            .store
            .get_account(mailbox.account_id)
            .map_err(SchedulerError::from_store)?
        else {
            return Ok(());
        };

        if user_request {
            if account.on_sync_disabled_hold() {
                info!("User requested sync of account in sync disabled hold; releasing");
                self.release_sync_holds(SyncErrorReason::AccessDenied, Some(account.id));
            } else if account.on_security_hold() {
                info!("User requested sync of account in security hold; releasing");
                self.release_sync_holds(SyncErrorReason::SecurityFailure, Some(account.id));
            }
            if inner.gate.is_holding() {
                inner.observers.mailbox_status(mailbox_id, SyncStatus::InProgress, 0);
                inner.observers.mailbox_status(mailbox_id, SyncStatus::ConnectionError, 0);
                return Ok(());
            }
        }

        match mailbox.kind {
            MailboxType::Outbox => {
                // Every queued message becomes a send candidate again
                inner
                    .store
                    .reset_send_failures(mailbox_id)
                    .map_err(SchedulerError::from_store)?;
                inner.with_state(|state| state.errors.remove(mailbox_id));
                inner.kick("start outbox");
            }
            MailboxType::Drafts | MailboxType::Trash => {
                inner.observers.mailbox_status(mailbox_id, SyncStatus::InProgress, 0);
                inner.observers.mailbox_status(mailbox_id, SyncStatus::Success, 100);
            }
            _ => {
                let reason = if user_request {
                    SyncReason::UiRequest
                } else {
                    SyncReason::ServiceStart
                };
                self.start_manual_sync(mailbox_id, reason, None)?;
            }
        }
        Ok(())
    }

    /// Start a mailbox now, outside its schedule
    ///
    /// Clears any error hold first. If a worker is already running, only a
    /// callback reason is recorded on it. Returns whether a worker started.
    pub fn start_manual_sync(
        &self,
        mailbox_id: MailboxId,
        reason: SyncReason,
        request: Option<SyncRequest>,
    ) -> Result<bool, SchedulerError> {
        self.inner.start_manual_sync(mailbox_id, reason, request)
    }

    /// Stop a mailbox's worker; it stays registered until it exits
    pub fn stop_manual_sync(&self, mailbox_id: MailboxId) {
        let now = Utc::now();
        self.inner.with_state(|state| {
            if state.registry.stop(mailbox_id, now) {
                info!("Stopping sync for mailbox {}", mailbox_id);
            }
        });
    }

    /// Ask for a sync `delay` from now
    ///
    /// A running worker gets an out-of-band wake; otherwise a manual sync
    /// starts.
    pub fn service_request(
        &self,
        mailbox_id: MailboxId,
        delay: Duration,
        reason: SyncReason,
    ) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let Some(mailbox) = inner.store.get_mailbox(mailbox_id).map_err(SchedulerError::from_store)?
        else {
            return Ok(());
        };
        if !is_server_backed(mailbox.kind) {
            return Ok(());
        }

        let at = add_duration(Utc::now(), delay);
        let running = inner.with_state(|state| state.registry.request_wake(mailbox_id, at));
        if running {
            inner.kick("service request");
        } else {
            inner.start_manual_sync(mailbox_id, reason, None)?;
        }
        Ok(())
    }

    /// Wake a running worker at the next pass, refreshing its account
    pub fn service_request_immediate(&self, mailbox_id: MailboxId) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let account = match inner.store.get_mailbox(mailbox_id).map_err(SchedulerError::from_store)? {
            Some(mailbox) => inner
                .store
                .get_account(mailbox.account_id)
                .map_err(SchedulerError::from_store)?,
            None => None,
        };
        let now = Utc::now();
        let woken = inner.with_state(|state| {
            if !state.registry.request_wake(mailbox_id, now) {
                return false;
            }
            if let Some(account) = &account {
                state.registry.update_account(account);
            }
            true
        });
        if woken {
            inner.kick("service request immediate");
        }
        Ok(())
    }

    /// Hand extra work to a mailbox's worker, starting one if needed
    pub fn send_request(&self, mailbox_id: MailboxId, request: SyncRequest) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let worker = inner.with_state(|state| {
            state.registry.get(mailbox_id).map(|h| h.worker().clone())
        });
        match worker {
            Some(worker) => {
                if !worker.alert(Some(request)) {
                    inner.release_unresponsive(mailbox_id);
                }
            }
            None => {
                inner.start_manual_sync(mailbox_id, SyncReason::PartRequest, Some(request))?;
                inner.kick("part request");
            }
        }
        Ok(())
    }

    /// Whether a mailbox is free to be pinged
    pub fn ping_status(&self, mailbox_id: MailboxId) -> PingStatus {
        self.inner.with_state(|state| {
            if state.registry.contains(mailbox_id) {
                return PingStatus::Running;
            }
            match state.errors.get(mailbox_id) {
                Some(error) if error.fatal => PingStatus::Unable,
                Some(error) if error.hold_end_time.is_some() => PingStatus::Waiting,
                _ => PingStatus::Ok,
            }
        })
    }

    /// Wake a running worker now
    ///
    /// Drafts and outbox workers are not alertable. A worker that does not
    /// respond is released.
    pub fn alert(&self, mailbox_id: MailboxId) {
        let worker = self.inner.with_state(|state| {
            state
                .registry
                .get(mailbox_id)
                .filter(|h| !matches!(h.kind, MailboxType::Drafts | MailboxType::Outbox))
                .map(|h| h.worker().clone())
        });
        if let Some(worker) = worker {
            if !worker.alert(None) {
                self.inner.release_unresponsive(mailbox_id);
            }
        }
    }

    // === Holds and accounts ===

    /// The account's server changed: lift its holds and restart its syncs
    pub fn host_changed(&self, account_id: AccountId) {
        let inner = &self.inner;
        let now = Utc::now();
        inner.with_state(|state| {
            let store = &inner.store;
            state
                .errors
                .retain(|mailbox_id, _| !matches!(store.get_mailbox(mailbox_id), Ok(None)));
            state.errors.unhold_account(account_id);
            inner.stop_account_syncs_locked(state, account_id, true, now);
        });
        inner.kick("host changed");
    }

    pub fn release_security_hold(&self, account_id: AccountId) -> bool {
        self.release_sync_holds(SyncErrorReason::SecurityFailure, Some(account_id))
    }

    /// Clear holds with `reason`, optionally for one account only
    pub fn release_sync_holds(&self, reason: SyncErrorReason, account_id: Option<AccountId>) -> bool {
        let released = self
            .inner
            .with_state(|state| state.errors.release(reason, account_id));
        self.inner.kick("hold release");
        released
    }

    /// Refresh the account snapshot held by the account's workers
    pub fn account_updated(&self, account_id: AccountId) -> Result<(), SchedulerError> {
        let Some(account) = self
            .inner
            .store
            .get_account(account_id)
            .map_err(SchedulerError::from_store)?
        else {
            return Ok(());
        };
        self.inner.with_state(|state| {
            state.registry.update_account(&account);
            state.accounts.insert(account);
        });
        Ok(())
    }

    /// Reconcile the cached accounts with the store
    pub fn accounts_changed(&self) -> Result<(), SchedulerError> {
        self.inner.accounts_changed()
    }

    /// Stop (and release) every worker of an account
    ///
    /// With `include_root` false, the account-root worker is only stopped.
    pub fn stop_account_syncs(&self, account_id: AccountId, include_root: bool) {
        let now = Utc::now();
        self.inner.with_state(|state| {
            self.inner
                .stop_account_syncs_locked(state, account_id, include_root, now)
        });
    }

    /// Record a failure reported outside a worker run
    pub fn record_error(
        &self,
        mailbox_id: MailboxId,
        reason: SyncErrorReason,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let Some(mailbox) = self
            .inner
            .store
            .get_mailbox(mailbox_id)
            .map_err(SchedulerError::from_store)?
        else {
            return Ok(());
        };
        self.inner.with_state(|state| {
            state
                .errors
                .record(mailbox_id, mailbox.account_id, reason, false, now);
        });
        Ok(())
    }

    // === Observers ===

    pub fn register_observer(&self, observer: Arc<dyn SyncObserver>) -> ObserverId {
        self.inner.observers.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.inner.observers.unregister(id)
    }

    // === Inspection ===

    pub fn sync_error(&self, mailbox_id: MailboxId) -> Option<SyncError> {
        self.inner
            .with_state(|state| state.errors.get(mailbox_id).cloned())
    }

    /// Mailboxes with a registered worker
    pub fn running(&self) -> Vec<MailboxId> {
        self.inner.with_state(|state| state.registry.ids())
    }

    pub fn is_running(&self, mailbox_id: MailboxId) -> bool {
        self.inner
            .with_state(|state| state.registry.contains(mailbox_id))
    }

    pub fn wake_lock(&self) -> &WakeLock {
        &self.inner.wake_lock
    }

    pub fn pending_alarm(&self, key: OwnerKey) -> Option<DateTime<Utc>> {
        self.inner.alarms.pending(key)
    }
}

/// Kinds that never load from the server
fn is_server_backed(kind: MailboxType) -> bool {
    !matches!(kind, MailboxType::Drafts | MailboxType::Trash)
}

fn final_status(outcome: ExitOutcome) -> (SyncStatus, u8) {
    match outcome {
        ExitOutcome::Done => (SyncStatus::Success, 100),
        ExitOutcome::IoError => (SyncStatus::ConnectionError, 0),
        ExitOutcome::LoginFailure => (SyncStatus::LoginFailed, 0),
        ExitOutcome::SecurityFailure => (SyncStatus::SecurityFailure, 0),
        ExitOutcome::AccessDenied => (SyncStatus::AccessDenied, 0),
        ExitOutcome::InternalError => (SyncStatus::InternalError, 0),
    }
}

impl Inner {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        *self.phase.lock() = phase;
    }

    fn kick(&self, reason: &str) {
        debug!("Kick: {}", reason);
        *self.kicked.lock() = true;
        self.kick_signal.notify_all();
        self.gate.nudge();
    }

    /// Run `f` under the sync lock, then deliver the callbacks it queued
    fn with_state<R>(&self, f: impl FnOnce(&mut SyncState) -> R) -> R {
        let (result, notices) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, std::mem::take(&mut state.notices))
        };
        self.deliver(notices);
        result
    }

    fn deliver(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::MailboxStatus(id, status, progress) => {
                    self.observers.mailbox_status(id, status, progress)
                }
                Notice::ListStatus(id, status, progress) => {
                    self.observers.mailbox_list_status(id, status, progress)
                }
                Notice::LoginFailed(id) => self.authority.on_login_failed(id),
                Notice::LoginSucceeded(id) => self.authority.on_login_succeeded(id),
                Notice::FatalError(id, reason) => self.authority.on_fatal_error(id, reason),
            }
        }
    }

    fn refresh_accounts(&self) -> Result<(), SchedulerError> {
        let accounts = self.store.list_accounts().map_err(SchedulerError::from_store)?;
        self.with_state(|state| {
            state.accounts.reconcile(accounts);
        });
        Ok(())
    }

    // === Loop ===

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.kick("stop");

        let handle = self.thread.lock().take();
        match handle {
            Some(handle) if handle.thread().id() != std::thread::current().id() => {
                if handle.join().is_err() {
                    error!("Scheduler loop panicked");
                    self.shutdown();
                }
            }
            Some(_) => {}
            None => self.shutdown(),
        }
    }

    fn run_loop(self: Arc<Self>) {
        info!("Scheduler loop started");
        while !self.is_stopping() {
            self.run_awake_self();

            if !self.gate.is_connected() && !self.await_connectivity() {
                break;
            }
            if self.is_stopping() {
                break;
            }

            self.set_phase(SchedulerPhase::Evaluating);
            *self.kicked.lock() = false;
            match self.check_mailboxes(Utc::now()) {
                Ok(bound) => {
                    debug!("Next evaluation in {}ms", bound.as_millis());
                    self.sleep(bound);
                }
                Err(SchedulerError::ProviderUnavailable) => {
                    error!("Mailbox store unavailable; shutting down and requesting restart");
                    self.restart_requested.store(true, Ordering::SeqCst);
                    self.shutdown();
                    self.observers.restart_requested();
                    return;
                }
                Err(e) => {
                    warn!("Evaluation pass failed: {}", e);
                    self.sleep(self.config.initial_hold_delay());
                }
            }
        }
        self.shutdown();
    }

    fn run_awake_self(&self) {
        self.wake_lock.acquire(OwnerKey::Scheduler);
        self.alarms.disarm(OwnerKey::Scheduler);
    }

    fn sleep(&self, bound: Duration) {
        let plan = plan_sleep(i64::try_from(bound.as_millis()).unwrap_or(i64::MAX), &self.config);
        if self.is_stopping() {
            return;
        }

        self.set_phase(SchedulerPhase::Sleeping);
        if let Some(alarm) = plan.alarm {
            self.alarms.arm(OwnerKey::Scheduler, alarm, Utc::now());
            self.wake_lock.release(OwnerKey::Scheduler);
        }

        // A kick that landed since the pass started skips the wait
        let mut kicked = self.kicked.lock();
        if !*kicked {
            self.kick_signal
                .wait_while_for(&mut kicked, |k| !*k, plan.sleep);
        }
        *kicked = false;
    }

    /// Block until the network is back; `false` if stopping instead
    fn await_connectivity(&self) -> bool {
        self.set_phase(SchedulerPhase::AwaitingConnectivity);
        let now = Utc::now();
        self.with_state(|state| {
            if !state.registry.is_empty() {
                info!("No connectivity; stopping {} sync(s)", state.registry.len());
            }
            Self::stop_all_locked(state, now);
        });

        // Kicks nudge the gate; they must not push the deadline back
        let deadline = Instant::now() + self.config.connectivity_wait();
        let mut waited = false;
        loop {
            if self.is_stopping() {
                return false;
            }
            if self.gate.is_connected() {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = if remaining.is_zero() {
                GateWait::TimedOut
            } else {
                if !waited {
                    self.alarms.arm(
                        OwnerKey::Scheduler,
                        remaining + CONNECTIVITY_ALARM_SLACK,
                        Utc::now(),
                    );
                    self.wake_lock.release(OwnerKey::Scheduler);
                    debug!("Waiting up to {}ms for connectivity", remaining.as_millis());
                }
                waited = true;
                self.gate.wait_connected(remaining)
            };

            match outcome {
                GateWait::Connected => break,
                GateWait::Nudged => continue,
                GateWait::TimedOut => {
                    info!("No connectivity after waiting; assuming it is available");
                    self.gate.assume_connected();
                    break;
                }
            }
        }

        self.run_awake_self();
        if waited {
            info!("Connectivity restored; releasing I/O holds");
            self.with_state(|state| {
                state.errors.release(SyncErrorReason::IoError, None);
                for (mailbox_id, error) in state.errors.iter() {
                    debug!(
                        "Remaining hold on mailbox {}: {:?} (fatal: {})",
                        mailbox_id, error.reason, error.fatal
                    );
                }
            });
        }
        true
    }

    /// Stop every worker, release them, drop alarms and the wake hold
    fn shutdown(&self) {
        let now = Utc::now();
        self.with_state(|state| {
            Self::stop_all_locked(state, now);
            for mailbox_id in state.registry.ids() {
                state.registry.release(mailbox_id);
            }
        });
        self.alarms.disarm_all();
        self.wake_lock.release(OwnerKey::Scheduler);
        self.set_phase(SchedulerPhase::Shutdown);
        info!("Scheduler stopped");
    }

    // === Evaluation ===

    fn check_mailboxes(&self, now: DateTime<Utc>) -> Result<Duration, SchedulerError> {
        let mailboxes = self
            .store
            .list_syncable_mailboxes(&MailboxFilter::syncable())
            .map_err(SchedulerError::from_store)?;

        self.with_state(|state| {
            let mut bound = WaitBound::new(self.config.heartbeat());
            let reaped = self.reap_locked(state, now, &mut bound)?;

            if !self.gate.is_connected() {
                Self::stop_all_locked(state, now);
                return Ok(bound.get());
            }

            // A reaped mailbox waits for the recheck before it restarts
            for mailbox in mailboxes.iter().filter(|m| !reaped.contains(&m.id)) {
                self.evaluate_mailbox(state, mailbox, now, &mut bound)?;
            }
            Ok(bound.get())
        })
    }

    /// Drop dead workers, workers of deleted mailboxes and workers that ignored a stop
    ///
    /// Covers every registered worker, syncable or not. Returns the mailboxes
    /// whose dead thread was released.
    fn reap_locked(
        &self,
        state: &mut SyncState,
        now: DateTime<Utc>,
        bound: &mut WaitBound,
    ) -> Result<Vec<MailboxId>, SchedulerError> {
        let mut reaped = Vec::new();
        for mailbox_id in state.registry.ids() {
            let exists = match self.store.get_mailbox(mailbox_id) {
                Ok(mailbox) => mailbox.is_some(),
                Err(e) => {
                    let err = SchedulerError::from_store(e);
                    if matches!(err, SchedulerError::ProviderUnavailable) {
                        return Err(err);
                    }
                    warn!("Failed to look up mailbox {}: {}", mailbox_id, err);
                    true
                }
            };

            if !state.registry.is_alive(mailbox_id) {
                state.registry.release(mailbox_id);
                if exists {
                    warn!("Dead thread for mailbox {}; releasing it", mailbox_id);
                    bound.tighten(self.config.dead_thread_recheck());
                    reaped.push(mailbox_id);
                } else {
                    info!("Deleted mailbox {}; removing its worker", mailbox_id);
                    state.errors.remove(mailbox_id);
                }
                continue;
            }

            if !exists && state.registry.stop(mailbox_id, now) {
                info!("Deleted mailbox {}; stopping its sync", mailbox_id);
            }

            let wedged = state.registry.get(mailbox_id).is_some_and(|h| {
                h.stop_requested_at
                    .is_some_and(|at| time_until(at, now).is_some_and(|d| d > self.config.stop_grace()))
            });
            if wedged {
                warn!("Worker for mailbox {} ignored stop; releasing it", mailbox_id);
                state.registry.release(mailbox_id);
            }
        }
        Ok(reaped)
    }

    fn evaluate_mailbox(
        &self,
        state: &mut SyncState,
        mailbox: &Mailbox,
        now: DateTime<Utc>,
        bound: &mut WaitBound,
    ) -> Result<(), SchedulerError> {
        let Some(account) = state.accounts.get(mailbox.account_id).cloned() else {
            return Ok(());
        };
        if account.on_sync_disabled_hold() {
            return Ok(());
        }

        if let Some(handle) = state.registry.get(mailbox.id) {
            let (request_time, worker) = (handle.request_time, handle.worker().clone());
            if let Some(at) = request_time {
                match request_wait(at, now, &self.config) {
                    RequestWait::Due => {
                        state.registry.clear_wake(mailbox.id);
                        if !worker.alert(None) {
                            warn!("Worker for {} did not respond; releasing", mailbox.display_name);
                            state.registry.release(mailbox.id);
                        }
                    }
                    RequestWait::Wait(wait) => bound.tighten(wait),
                    RequestWait::TooFar(wait) => {
                        warn!(
                            "Illegal wake request for {} in {}ms",
                            mailbox.display_name,
                            wait.as_millis()
                        );
                    }
                }
            }
            return Ok(());
        }

        if !self.is_mailbox_syncable(&account, mailbox.kind) {
            return Ok(());
        }

        if let Some(error) = state.errors.get(mailbox.id) {
            if error.fatal {
                return Ok(());
            }
            if let Some(wait) = error.hold_end_time.and_then(|end| time_until(now, end)) {
                bound.tighten(wait);
                return Ok(());
            }
            // Keep the entry so the next failure escalates
            state.errors.clear_hold_end(mailbox.id);
        }

        if mailbox.interval == SyncInterval::Push {
            self.request_sync(state, mailbox, &account, SyncReason::Push, None, now);
        } else if mailbox.kind == MailboxType::Outbox {
            match self.store.has_sendable_items(mailbox.id) {
                Ok(true) => {
                    self.request_sync(state, mailbox, &account, SyncReason::Upsync, None, now);
                }
                Ok(false) => {}
                Err(e) => {
                    let err = SchedulerError::from_store(e);
                    if matches!(err, SchedulerError::ProviderUnavailable) {
                        return Err(err);
                    }
                    warn!("Failed to check outbox {}: {}", mailbox.id, err);
                }
            }
        } else {
            match interval_due(mailbox, now, self.config.max_interval_minutes) {
                IntervalDue::Due => {
                    self.request_sync(state, mailbox, &account, SyncReason::Scheduled, None, now);
                }
                IntervalDue::Wait(wait) => {
                    debug!("Next sync for {} in {}s", mailbox.display_name, wait.as_secs());
                    bound.tighten(wait);
                }
                IntervalDue::NotScheduled => {}
            }
        }
        Ok(())
    }

    /// Whether policy and settings allow automatic sync of this kind
    fn is_mailbox_syncable(&self, account: &Account, kind: MailboxType) -> bool {
        match kind {
            MailboxType::Outbox | MailboxType::AccountRoot => true,
            MailboxType::Contacts => account.sync_contacts,
            MailboxType::Calendar => account.sync_calendar,
            MailboxType::Trash => false,
            MailboxType::Inbox | MailboxType::Drafts | MailboxType::Other => {
                let roaming_blocked = account.manual_sync_when_roaming && self.gate.is_roaming();
                account.sync_email && self.background_data.load(Ordering::SeqCst) && !roaming_blocked
            }
        }
    }

    /// Start a worker unless stopping, offline, or already running
    fn request_sync(
        &self,
        state: &mut SyncState,
        mailbox: &Mailbox,
        account: &Account,
        reason: SyncReason,
        request: Option<SyncRequest>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_stopping() || !self.gate.is_connected() {
            if reason.is_callback() {
                state.notices.push(Notice::status(
                    mailbox.id,
                    mailbox.kind,
                    account.id,
                    SyncStatus::ConnectionError,
                    0,
                ));
            }
            return false;
        }

        let link: Weak<dyn WorkerLink> = self.me.clone();
        let weak = self.me.clone();
        let started = state.registry.start(
            StartRequest {
                mailbox,
                account,
                reason,
                request,
                now,
            },
            self.factory.as_ref(),
            link,
            move |exit| {
                if let Some(inner) = weak.upgrade() {
                    inner.done(exit);
                }
            },
        );

        match started {
            Ok(_) => {
                if mailbox.kind != MailboxType::AccountRoot {
                    // The root worker's ping set no longer includes this mailbox
                    if let Some(root) = state.registry.account_root(account.id) {
                        root.worker().reset();
                    }
                }
                if reason.is_callback() {
                    state.notices.push(Notice::status(
                        mailbox.id,
                        mailbox.kind,
                        account.id,
                        SyncStatus::InProgress,
                        0,
                    ));
                }
                true
            }
            Err(SchedulerError::AlreadyRunning(_)) => false,
            Err(e) => {
                warn!("Failed to start sync for {}: {}", mailbox.display_name, e);
                if reason.is_callback() {
                    state.notices.push(Notice::status(
                        mailbox.id,
                        mailbox.kind,
                        account.id,
                        SyncStatus::InternalError,
                        0,
                    ));
                }
                false
            }
        }
    }

    fn start_manual_sync(
        &self,
        mailbox_id: MailboxId,
        reason: SyncReason,
        request: Option<SyncRequest>,
    ) -> Result<bool, SchedulerError> {
        let Some(mailbox) = self
            .store
            .get_mailbox(mailbox_id)
            .map_err(SchedulerError::from_store)?
        else {
            return Ok(false);
        };
        let Some(account) = self
            .store
            .get_account(mailbox.account_id)
            .map_err(SchedulerError::from_store)?
        else {
            return Ok(false);
        };

        let now = Utc::now();
        Ok(self.with_state(|state| {
            if state.registry.contains(mailbox_id) {
                if reason.is_callback() {
                    state.registry.set_reason(mailbox_id, reason);
                }
                return false;
            }
            state.errors.remove(mailbox_id);
            info!("Starting sync for {}", mailbox.display_name);
            self.request_sync(state, &mailbox, &account, reason, request, now)
        }))
    }

    fn stop_all_locked(state: &mut SyncState, now: DateTime<Utc>) {
        for mailbox_id in state.registry.ids() {
            state.registry.stop(mailbox_id, now);
        }
    }

    fn stop_account_syncs_locked(
        &self,
        state: &mut SyncState,
        account_id: AccountId,
        include_root: bool,
        now: DateTime<Utc>,
    ) {
        for mailbox_id in state.registry.ids_for_account(account_id) {
            let is_root = state
                .registry
                .get(mailbox_id)
                .is_some_and(|h| h.kind == MailboxType::AccountRoot);
            state.registry.stop(mailbox_id, now);
            if include_root || !is_root {
                state.registry.release(mailbox_id);
            }
        }
    }

    fn release_unresponsive(&self, mailbox_id: MailboxId) {
        warn!("Worker for mailbox {} did not respond; releasing", mailbox_id);
        self.with_state(|state| {
            state.registry.release(mailbox_id);
        });
        self.kick("unresponsive worker");
    }

    fn accounts_changed(&self) -> Result<(), SchedulerError> {
        let fresh = self.store.list_accounts().map_err(SchedulerError::from_store)?;
        let now = Utc::now();

        let changes = self.with_state(|state| {
            let changes = state.accounts.reconcile(fresh);
            for account in &changes.removed {
                info!("Account {} deleted; stopping its syncs", account.display_name);
                self.stop_account_syncs_locked(state, account.id, true, now);
                state.errors.retain(|_, e| e.account_id != account.id);
            }
            for account in &changes.updated {
                state.registry.update_account(account);
            }
            for account in &changes.interval_changed {
                info!("Account {} changed; stopping its syncs", account.display_name);
                self.stop_account_syncs_locked(state, account.id, true, now);
            }
            for account_id in &changes.security_released {
                state
                    .errors
                    .release(SyncErrorReason::SecurityFailure, Some(*account_id));
            }
            changes
        });

        // Outside the lock: store writes call back into the scheduler
        for account in &changes.interval_changed {
            if let Err(e) = self
                .store
                .update_inbox_interval(account.id, account.sync_interval)
            {
                warn!(
                    "Failed to update inbox interval for {}: {}",
                    account.display_name, e
                );
            }
        }

        self.kick("accounts changed");
        Ok(())
    }

    // === Completion ===

    fn done(&self, exit: WorkerExit) {
        let now = Utc::now();
        let mailbox_id = exit.mailbox_id;
        self.with_state(|state| {
            let Some(handle) = state.registry.get(mailbox_id) else {
                return;
            };
            if handle.token != exit.token {
                debug!("Ignoring stale exit report for mailbox {}", mailbox_id);
                return;
            }
            let (reason, kind, account_id) = (handle.reason, handle.kind, handle.account.id);
            state.registry.release_if_current(mailbox_id, exit.token);

            match self.store.get_mailbox(mailbox_id) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("Mailbox {} was deleted during its sync", mailbox_id);
                    state.errors.remove(mailbox_id);
                    return;
                }
                Err(e) => {
                    warn!("Failed to look up finished mailbox {}: {}", mailbox_id, e);
                    return;
                }
            }

            if exit.outcome != ExitOutcome::LoginFailure
                && state
                    .errors
                    .release(SyncErrorReason::LoginFailure, Some(account_id))
            {
                state.notices.push(Notice::LoginSucceeded(account_id));
            }

            match exit.outcome {
                ExitOutcome::Done => {
                    state.errors.remove(mailbox_id);
                }
                ExitOutcome::IoError => {
                    let error = state.errors.record(
                        mailbox_id,
                        account_id,
                        SyncErrorReason::IoError,
                        false,
                        now,
                    );
                    info!(
                        "I/O error on mailbox {}; holding for {}s",
                        mailbox_id,
                        error.hold_delay.as_secs()
                    );
                }
                ExitOutcome::LoginFailure => {
                    state.notices.push(Notice::LoginFailed(account_id));
                    state.errors.record(
                        mailbox_id,
                        account_id,
                        SyncErrorReason::LoginFailure,
                        true,
                        now,
                    );
                }
                ExitOutcome::SecurityFailure
                | ExitOutcome::AccessDenied
                | ExitOutcome::InternalError => {
                    if let Some(error_reason) = exit.outcome.error_reason() {
                        state
                            .errors
                            .record(mailbox_id, account_id, error_reason, true, now);
                        state.notices.push(Notice::FatalError(account_id, error_reason));
                    }
                }
            }

            if reason.is_callback() {
                let (status, progress) = final_status(exit.outcome);
                state
                    .notices
                    .push(Notice::status(mailbox_id, kind, account_id, status, progress));
            }
        });
        self.kick("sync finished");
    }
}

impl WorkerLink for Inner {
    fn run_awake(&self, mailbox_id: MailboxId) {
        let key = OwnerKey::Mailbox(mailbox_id);
        self.wake_lock.acquire(key);
        self.alarms.disarm(key);
    }

    fn run_asleep(&self, mailbox_id: MailboxId, delay: Duration) {
        let key = OwnerKey::Mailbox(mailbox_id);
        self.alarms.arm(key, delay, Utc::now());
        self.wake_lock.release(key);
    }

    fn release_awake(&self, mailbox_id: MailboxId) {
        self.wake_lock.release(OwnerKey::Mailbox(mailbox_id));
    }
}

impl AlarmTarget for Inner {
    fn on_alarm(&self, key: OwnerKey) {
        self.alarms.fired(key);
        match key {
            OwnerKey::Scheduler => self.kick("alarm"),
            OwnerKey::Mailbox(mailbox_id) => {
                let now = Utc::now();
                self.with_state(|state| state.registry.request_wake(mailbox_id, now));
                self.kick("mailbox alarm");
            }
        }
    }
}
