//! Sync scheduling: deciding when each mailbox syncs and recovering from failures
//!
//! The [`Scheduler`] is the entry point. The other modules are its parts:
//! worker registry, error holds, alarms, wake holds, connectivity gating,
//! status observers and timing math.

mod account_cache;
mod alarm;
mod authority;
mod connectivity;
mod error_table;
mod observer;
mod registry;
mod scheduler;
mod timing;
mod wake_lock;
mod worker;

pub use account_cache::{AccountCache, AccountChanges};
pub use alarm::{
    AlarmProvider, AlarmSet, AlarmTarget, NoopAlarmProvider, OwnerKey, TimerAlarmProvider,
};
pub use authority::{CredentialAuthority, NoopAuthority};
pub use connectivity::{ConnectivityGate, GateWait, NetworkInfo};
pub use error_table::{SyncError, SyncErrorTable};
pub use observer::{ObserverId, ObserverList, SyncObserver, SyncStatus};
pub use registry::{LivenessToken, WorkerExit, WorkerHandle, WorkerRegistry};
pub use scheduler::{PingStatus, Scheduler, SchedulerBuilder, SchedulerPhase};
pub use timing::{
    IntervalDue, RequestWait, SleepPlan, WaitBound, interval_due, next_hold_delay, plan_sleep,
    request_wait,
};
pub use wake_lock::{KeepAwake, NoopKeepAwake, WakeLock};
pub use worker::{StopToken, SyncWorker, WorkerContext, WorkerFactory, WorkerLink};
