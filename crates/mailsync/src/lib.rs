//! Mailsync - Mailbox synchronization scheduler
//!
//! This crate decides when each mailbox of each account is synchronized,
//! whether a sync may run at all, and how failures are recovered from:
//! - Domain models (Account, Mailbox, SyncInterval, SyncRequest)
//! - Storage trait abstractions with SQLite and in-memory stores
//! - The scheduler loop, worker registry and error holds
//! - Host seams for alarms, keep-awake, connectivity and credentials
//!
//! The sync protocol itself is out of scope: workers are supplied by the
//! host through [`WorkerFactory`].

pub mod config;
pub mod error;
pub mod models;
pub mod storage;
pub mod sync;

pub use crate::config::{SCHEDULER_CONFIG_FILE, SchedulerConfig};
pub use error::{
    ExitOutcome, ProviderUnavailableError, SchedulerError, SyncErrorReason,
    is_provider_unavailable,
};
pub use models::{
    Account, AccountFlags, AccountId, Mailbox, MailboxId, MailboxType, MeetingResponse,
    SyncInterval, SyncReason, SyncRequest,
};
pub use storage::{
    InMemorySyncStore, MailboxFilter, SqliteSyncStore, StoreChange, StoreListener, SyncStore,
};
pub use sync::{
    // Scheduler
    PingStatus, Scheduler, SchedulerBuilder, SchedulerPhase,
    // Worker contract
    StopToken, SyncWorker, WorkerContext, WorkerFactory, WorkerLink,
    // Host seams
    AlarmProvider, AlarmTarget, ConnectivityGate, CredentialAuthority, KeepAwake, NetworkInfo,
    NoopAlarmProvider, NoopAuthority, NoopKeepAwake, OwnerKey, TimerAlarmProvider,
    // Status
    ObserverId, SyncError, SyncObserver, SyncStatus,
};
