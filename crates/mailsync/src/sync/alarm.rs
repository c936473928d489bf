//! Deferred wake-ups for the scheduler and individual workers
//!
//! [`AlarmSet`] tracks at most one pending alarm per owner and forwards arms
//! and cancels to an [`AlarmProvider`]. The provider delivers a fired alarm
//! back through [`AlarmTarget::on_alarm`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use super::timing::{add_duration, time_until};
use crate::models::MailboxId;

/// Who an alarm or wake hold belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnerKey {
    /// The scheduler loop itself
    Scheduler,
    /// The worker of one mailbox
    Mailbox(MailboxId),
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerKey::Scheduler => write!(f, "scheduler"),
            OwnerKey::Mailbox(id) => write!(f, "mailbox {id}"),
        }
    }
}

/// Receives fired alarms
pub trait AlarmTarget: Send + Sync {
    fn on_alarm(&self, key: OwnerKey);
}

/// Host facility that delivers alarms at wall-clock times
pub trait AlarmProvider: Send + Sync {
    /// Schedule delivery for `key` at `at`, replacing any earlier arm
    fn arm_at(&self, key: OwnerKey, at: DateTime<Utc>);

    /// Cancel delivery for `key`
    fn cancel(&self, key: OwnerKey);

    /// Connect the provider to whoever handles fired alarms
    fn bind(&self, _target: Weak<dyn AlarmTarget>) {}
}

/// Provider that never fires
///
/// Suitable when the loop's own timed waits are enough, as in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAlarmProvider;

impl AlarmProvider for NoopAlarmProvider {
    fn arm_at(&self, _key: OwnerKey, _at: DateTime<Utc>) {}

    fn cancel(&self, _key: OwnerKey) {}
}

/// Pending alarms, one per owner
pub struct AlarmSet {
    pending: Mutex<HashMap<OwnerKey, DateTime<Utc>>>,
    provider: Arc<dyn AlarmProvider>,
}

impl AlarmSet {
    pub fn new(provider: Arc<dyn AlarmProvider>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            provider,
        }
    }

    pub fn provider(&self) -> &Arc<dyn AlarmProvider> {
        &self.provider
    }

    /// Arm `key` to fire `delay` after `now`; the last arm wins
    pub fn arm(&self, key: OwnerKey, delay: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = add_duration(now, delay);
        self.pending.lock().insert(key, at);
        self.provider.arm_at(key, at);
        debug!("Alarm set for {} in {}ms", key, delay.as_millis());
        at
    }

    /// Cancel the alarm of `key`, if any
    pub fn disarm(&self, key: OwnerKey) {
        if self.pending.lock().remove(&key).is_some() {
            self.provider.cancel(key);
        }
    }

    /// Cancel every alarm
    pub fn disarm_all(&self) {
        let keys: Vec<_> = self.pending.lock().drain().map(|(key, _)| key).collect();
        for key in keys {
            self.provider.cancel(key);
        }
    }

    /// Forget an alarm that has been delivered
    pub fn fired(&self, key: OwnerKey) {
        self.pending.lock().remove(&key);
    }

    pub fn pending(&self, key: OwnerKey) -> Option<DateTime<Utc>> {
        self.pending.lock().get(&key).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

struct TimerState {
    deadlines: HashMap<OwnerKey, DateTime<Utc>>,
    target: Option<Weak<dyn AlarmTarget>>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// Provider backed by one timer thread
///
/// The thread sleeps until the earliest deadline (or a change) and delivers
/// due alarms outside its lock. It exits when the provider is dropped.
pub struct TimerAlarmProvider {
    shared: Arc<TimerShared>,
}

impl TimerAlarmProvider {
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                deadlines: HashMap::new(),
                target: None,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });
        let thread_shared = shared.clone();
        std::thread::Builder::new()
            .name("alarm-timer".to_string())
            .spawn(move || run_timer(&thread_shared))?;
        Ok(Self { shared })
    }
}

impl AlarmProvider for TimerAlarmProvider {
    fn arm_at(&self, key: OwnerKey, at: DateTime<Utc>) {
        self.shared.state.lock().deadlines.insert(key, at);
        self.shared.changed.notify_one();
    }

    fn cancel(&self, key: OwnerKey) {
        self.shared.state.lock().deadlines.remove(&key);
        self.shared.changed.notify_one();
    }

    fn bind(&self, target: Weak<dyn AlarmTarget>) {
        self.shared.state.lock().target = Some(target);
        self.shared.changed.notify_one();
    }
}

impl Drop for TimerAlarmProvider {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.changed.notify_one();
    }
}

fn run_timer(shared: &TimerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }

        let now = Utc::now();
        let next = state
            .deadlines
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(key, at)| (*key, *at));

        match next {
            None => shared.changed.wait(&mut state),
            Some((key, at)) => match time_until(now, at) {
                Some(wait) => {
                    shared.changed.wait_for(&mut state, wait);
                }
                None => {
                    state.deadlines.remove(&key);
                    let target = state.target.as_ref().and_then(Weak::upgrade);
                    match target {
                        Some(target) => {
                            // Deliver without the lock so the target may re-arm
                            drop(state);
                            target.on_alarm(key);
                            drop(target);
                            state = shared.state.lock();
                        }
                        None => warn!("Alarm for {} fired with no target bound", key),
                    }
                }
            },
        }
    }
    debug!("Alarm timer stopped");
}
