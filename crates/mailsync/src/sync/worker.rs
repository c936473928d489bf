//! Worker contract
//!
//! A [`SyncWorker`] performs one mailbox's synchronization on a dedicated
//! thread. The protocol itself is opaque to the scheduler: it only starts
//! workers, asks them to stop, alerts them, and reads their [`ExitOutcome`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Condvar, Mutex};

use crate::error::ExitOutcome;
use crate::models::{Account, Mailbox, MailboxId, SyncReason, SyncRequest};

/// One mailbox's synchronization, run on its own thread
pub trait SyncWorker: Send + Sync {
    /// Run until the sync finishes or a stop is requested
    fn run(&self) -> ExitOutcome;

    /// Forced interrupt: break out of blocking I/O
    ///
    /// The cooperative flag on the worker's [`StopToken`] has already been
    /// set when this is called.
    fn request_stop(&self);

    /// Wake the worker, optionally handing it extra work
    ///
    /// Returning `false` means the worker is unresponsive and the scheduler
    /// should release it.
    fn alert(&self, request: Option<SyncRequest>) -> bool;

    /// Recompute internal state after another mailbox of the account started
    fn reset(&self) {}
}

/// Creates workers for the scheduler
pub trait WorkerFactory: Send + Sync {
    fn create(&self, ctx: WorkerContext, request: Option<SyncRequest>) -> Result<Arc<dyn SyncWorker>>;
}

struct StopState {
    cancelled: Mutex<bool>,
    changed: Condvar,
}

/// Cooperative stop flag shared between the scheduler and one worker
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<StopState>,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopState {
                cancelled: Mutex::new(false),
                changed: Condvar::new(),
            }),
        }
    }

    /// Request a stop and wake any interruptible wait
    pub fn cancel(&self) {
        *self.inner.cancelled.lock() = true;
        self.inner.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns `false` if the token was (or became) cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        if !*cancelled {
            self.inner
                .changed
                .wait_while_for(&mut cancelled, |c| !*c, duration);
        }
        !*cancelled
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler services a running worker may call back into
pub trait WorkerLink: Send + Sync {
    /// The worker is busy: hold the device awake, cancel its alarm
    fn run_awake(&self, mailbox_id: MailboxId);

    /// The worker is about to block for `delay`: arm its alarm, drop its wake hold
    fn run_asleep(&self, mailbox_id: MailboxId, delay: Duration);

    /// Drop the wake hold taken by a worker that was stopped meanwhile
    fn release_awake(&self, mailbox_id: MailboxId);
}

struct DetachedLink;

impl WorkerLink for DetachedLink {
    fn run_awake(&self, _mailbox_id: MailboxId) {}
    fn run_asleep(&self, _mailbox_id: MailboxId, _delay: Duration) {}
    fn release_awake(&self, _mailbox_id: MailboxId) {}
}

/// Everything a worker gets from the scheduler at creation
#[derive(Clone)]
pub struct WorkerContext {
    pub mailbox: Mailbox,
    pub account: Account,
    pub reason: SyncReason,
    pub stop: StopToken,
    link: Weak<dyn WorkerLink>,
}

impl WorkerContext {
    pub fn new(
        mailbox: Mailbox,
        account: Account,
        reason: SyncReason,
        stop: StopToken,
        link: Weak<dyn WorkerLink>,
    ) -> Self {
        Self {
            mailbox,
            account,
            reason,
            stop,
            link,
        }
    }

    /// A context not attached to any scheduler
    pub fn detached(mailbox: Mailbox, account: Account, reason: SyncReason) -> Self {
        let link: Weak<dyn WorkerLink> = Weak::<DetachedLink>::new();
        Self::new(mailbox, account, reason, StopToken::new(), link)
    }

    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox.id
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Interruptible sleep; `false` if a stop was requested
    pub fn sleep(&self, duration: Duration) -> bool {
        self.stop.sleep(duration)
    }

    /// Hold the device awake while working
    ///
    /// A stop that lands concurrently has already dropped the hold on the
    /// scheduler side, so the hold is handed back if the token is cancelled
    /// by the time it was taken.
    pub fn run_awake(&self) {
        if let Some(link) = self.link.upgrade() {
            link.run_awake(self.mailbox.id);
            if self.is_stopped() {
                link.release_awake(self.mailbox.id);
            }
        }
    }

    pub fn run_asleep(&self, delay: Duration) {
        if let Some(link) = self.link.upgrade() {
            link.run_asleep(self.mailbox.id, delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, MailboxType};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_stop_token_sleep_runs_full_length() {
        let token = StopToken::new();
        let start = Instant::now();
        assert!(token.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_stop_token_cancel_interrupts_sleep() {
        let token = StopToken::new();
        let sleeper = {
            let token = token.clone();
            thread::spawn(move || token.sleep(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert!(!sleeper.join().unwrap());
        assert!(token.is_cancelled());
        assert!(!token.sleep(Duration::from_secs(30)));
    }

    #[test]
    fn test_detached_context() {
        let mailbox = Mailbox::new(MailboxId::new(1), AccountId::new(1), MailboxType::Inbox, "Inbox");
        let account = Account::new(AccountId::new(1), "a@example.com");
        let ctx = WorkerContext::detached(mailbox, account, SyncReason::Push);

        ctx.run_awake();
        ctx.run_asleep(Duration::from_secs(1));
        assert_eq!(ctx.mailbox_id(), MailboxId::new(1));
        assert!(!ctx.is_stopped());
        ctx.stop.cancel();
        assert!(ctx.is_stopped());
    }
}
