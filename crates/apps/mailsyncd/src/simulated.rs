//! Simulated workers standing in for a real sync protocol
//!
//! Each run pretends to talk to the server for `work` and then reports an
//! outcome. Push mailboxes park between rounds like a long-poll would.
//! Every `fail_every`-th run across the process reports an I/O error so the
//! backoff path gets exercised.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{debug, info, warn};
use mailsync::{
    ExitOutcome, MailboxId, MailboxType, SyncInterval, SyncRequest, SyncStore, SyncWorker,
    WorkerContext, WorkerFactory,
};
use parking_lot::Mutex;

use crate::fixture::OutgoingMessage;

#[derive(Debug, Clone, Copy)]
pub struct SimulationOptions {
    /// Time one sync round takes
    pub work: Duration,
    /// How long a push worker parks between rounds
    pub push_wait: Duration,
    /// Fail every Nth run with an I/O error (0 never fails)
    pub fail_every: u64,
}

/// State shared by the factory and every worker it made
struct Simulation {
    store: Arc<dyn SyncStore>,
    options: SimulationOptions,
    runs: AtomicU64,
    /// Messages the outbox workers still have to "send"
    outgoing: Mutex<HashMap<MailboxId, Vec<i64>>>,
}

pub struct SimulatedFactory {
    simulation: Arc<Simulation>,
}

impl SimulatedFactory {
    pub fn new(
        store: Arc<dyn SyncStore>,
        options: SimulationOptions,
        outgoing: &[OutgoingMessage],
    ) -> Self {
        let mut queued: HashMap<MailboxId, Vec<i64>> = HashMap::new();
        for message in outgoing {
            queued.entry(message.outbox).or_default().push(message.message_id);
        }
        Self {
            simulation: Arc::new(Simulation {
                store,
                options,
                runs: AtomicU64::new(0),
                outgoing: Mutex::new(queued),
            }),
        }
    }
}

impl Simulation {
    fn next_run_fails(&self) -> bool {
        let run = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        self.options.fail_every > 0 && run % self.options.fail_every == 0
    }

    fn take_outgoing(&self, outbox: MailboxId) -> Vec<i64> {
        self.outgoing.lock().remove(&outbox).unwrap_or_default()
    }
}

impl WorkerFactory for SimulatedFactory {
    fn create(&self, ctx: WorkerContext, request: Option<SyncRequest>) -> Result<Arc<dyn SyncWorker>> {
        Ok(Arc::new(SimulatedWorker {
            ctx,
            simulation: Arc::clone(&self.simulation),
            initial_request: Mutex::new(request),
        }))
    }
}

struct SimulatedWorker {
    ctx: WorkerContext,
    simulation: Arc<Simulation>,
    initial_request: Mutex<Option<SyncRequest>>,
}

impl SimulatedWorker {
    /// One round against the "server"; `None` when stopped midway
    fn round(&self) -> Option<ExitOutcome> {
        self.ctx.run_awake();
        if let Some(request) = self.initial_request.lock().take() {
            info!("{}: handling {:?}", self.ctx.mailbox.display_name, request);
        }
        if !self.ctx.sleep(self.simulation.options.work) {
            return None;
        }
        if self.simulation.next_run_fails() {
            warn!("{}: simulated network failure", self.ctx.mailbox.display_name);
            return Some(ExitOutcome::IoError);
        }

        if self.ctx.mailbox.kind == MailboxType::Outbox {
            self.send_queued();
        } else if let Err(e) = self.record_sync_time() {
            warn!("{}: failed to record sync time: {}", self.ctx.mailbox.display_name, e);
            return Some(ExitOutcome::InternalError);
        }
        Some(ExitOutcome::Done)
    }

    /// Re-read the mailbox so settings changed meanwhile are not clobbered
    fn record_sync_time(&self) -> Result<()> {
        let store = &self.simulation.store;
        if let Some(mailbox) = store.get_mailbox(self.ctx.mailbox_id())? {
            store.upsert_mailbox(mailbox.with_last_sync(Utc::now()))?;
        }
        Ok(())
    }

    fn send_queued(&self) {
        let outbox = self.ctx.mailbox_id();
        for message_id in self.simulation.take_outgoing(outbox) {
            match self.simulation.store.remove_outgoing(outbox, message_id) {
                Ok(()) => info!("Sent message {} from {}", message_id, outbox),
                Err(e) => warn!("Failed to dequeue message {}: {}", message_id, e),
            }
        }
    }
}

impl SyncWorker for SimulatedWorker {
    fn run(&self) -> ExitOutcome {
        debug!(
            "{} ({}) starting: {:?}",
            self.ctx.mailbox.display_name, self.ctx.account.display_name, self.ctx.reason
        );
        if self.ctx.mailbox.interval != SyncInterval::Push {
            return self.round().unwrap_or(ExitOutcome::Done);
        }

        loop {
            match self.round() {
                Some(ExitOutcome::Done) => {}
                Some(outcome) => return outcome,
                None => return ExitOutcome::Done,
            }
            let wait = self.simulation.options.push_wait;
            self.ctx.run_asleep(wait);
            if !self.ctx.sleep(wait) {
                return ExitOutcome::Done;
            }
        }
    }

    fn request_stop(&self) {
        debug!("{}: stop requested", self.ctx.mailbox.display_name);
    }

    fn alert(&self, request: Option<SyncRequest>) -> bool {
        if let Some(request) = request {
            info!("{}: alerted with {:?}", self.ctx.mailbox.display_name, request);
        }
        true
    }

    fn reset(&self) {
        debug!("{}: ping set reset", self.ctx.mailbox.display_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsync::{Account, AccountId, InMemorySyncStore, Mailbox, SyncReason};

    fn options(fail_every: u64) -> SimulationOptions {
        SimulationOptions {
            work: Duration::from_millis(1),
            push_wait: Duration::from_millis(1),
            fail_every,
        }
    }

    fn context(mailbox: Mailbox) -> WorkerContext {
        let account = Account::new(AccountId::new(1), "a@example.com");
        WorkerContext::detached(mailbox, account, SyncReason::Scheduled)
    }

    #[test]
    fn test_poll_round_records_sync_time() {
        let store = Arc::new(InMemorySyncStore::new());
        let mailbox = Mailbox::new(MailboxId::new(5), AccountId::new(1), MailboxType::Inbox, "Inbox")
            .with_interval(SyncInterval::Minutes(15));
        store.upsert_mailbox(mailbox.clone()).unwrap();

        let factory = SimulatedFactory::new(store.clone(), options(0), &[]);
        let worker = factory.create(context(mailbox), None).unwrap();

        assert_eq!(worker.run(), ExitOutcome::Done);
        assert!(store.get_mailbox(MailboxId::new(5)).unwrap().unwrap().last_sync.is_some());
    }

    #[test]
    fn test_fail_every_reports_io_error() {
        let store = Arc::new(InMemorySyncStore::new());
        let mailbox = Mailbox::new(MailboxId::new(5), AccountId::new(1), MailboxType::Other, "Box")
            .with_interval(SyncInterval::Minutes(5));
        let factory = SimulatedFactory::new(store, options(2), &[]);

        let first = factory.create(context(mailbox.clone()), None).unwrap().run();
        let second = factory.create(context(mailbox), None).unwrap().run();
        assert_eq!(first, ExitOutcome::Done);
        assert_eq!(second, ExitOutcome::IoError);
    }

    #[test]
    fn test_outbox_round_sends_queued() {
        let store = Arc::new(InMemorySyncStore::new());
        let outbox = MailboxId::new(7);
        store.queue_outgoing(outbox, 1).unwrap();
        let queued = [OutgoingMessage { outbox, message_id: 1 }];
        let factory = SimulatedFactory::new(store.clone(), options(0), &queued);
        let mailbox = Mailbox::new(outbox, AccountId::new(1), MailboxType::Outbox, "Outbox");

        assert_eq!(factory.create(context(mailbox), None).unwrap().run(), ExitOutcome::Done);
        assert!(!store.has_sendable_items(outbox).unwrap());
    }
}
