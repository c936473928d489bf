//! mailsyncd - headless mailbox sync scheduler
//!
//! Seeds a store from a JSON fixture and runs the scheduler against
//! simulated workers, logging every status change. Useful for watching the
//! scheduling, backoff and connectivity behavior without a mail server.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use mailsync::{
    AccountId, InMemorySyncStore, MailboxId, NetworkInfo, Scheduler, SchedulerConfig,
    SqliteSyncStore, SyncObserver, SyncStatus, SyncStore, TimerAlarmProvider,
};

mod fixture;
mod simulated;

use fixture::Fixture;
use simulated::{SimulatedFactory, SimulationOptions};

#[derive(Parser, Debug)]
#[command(name = "mailsyncd")]
#[command(about = "Run the mailbox sync scheduler against simulated workers")]
struct Args {
    /// Fixture with accounts, mailboxes and queued outgoing mail (built-in demo if omitted)
    #[arg(long, env = "MAILSYNCD_FIXTURE")]
    fixture: Option<PathBuf>,

    /// SQLite database to use instead of an in-memory store
    #[arg(long, env = "MAILSYNCD_DB")]
    db: Option<PathBuf>,

    /// Scheduler config file (defaults to scheduler.json in the config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Save the effective scheduler config to the config directory and exit
    #[arg(long)]
    write_config: bool,

    /// Seconds to run before stopping (0 runs until killed)
    #[arg(long, default_value = "60")]
    run_secs: u64,

    /// Milliseconds one simulated sync round takes
    #[arg(long, default_value = "500")]
    work_ms: u64,

    /// Seconds a simulated push worker waits between rounds
    #[arg(long, default_value = "20")]
    push_wait_secs: u64,

    /// Report an I/O error on every Nth worker run (0 never fails)
    #[arg(long, default_value = "0")]
    fail_every: u64,

    /// Start with the network down; it comes up after this many seconds
    #[arg(long)]
    offline_secs: Option<u64>,
}

/// Logs every status callback
struct LoggingObserver;

impl SyncObserver for LoggingObserver {
    fn sync_mailbox_status(&self, mailbox_id: MailboxId, status: SyncStatus, progress: u8) {
        info!("Mailbox {}: {:?} ({}%)", mailbox_id, status, progress);
    }

    fn sync_mailbox_list_status(&self, account_id: AccountId, status: SyncStatus, progress: u8) {
        info!("Folder list of account {}: {:?} ({}%)", account_id, status, progress);
    }

    fn restart_requested(&self) {
        error!("Scheduler lost its store and asked for a restart");
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SchedulerConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            SchedulerConfig::from_json(&json)
        }
        None => SchedulerConfig::load(),
    }
}

fn open_store(db: Option<&PathBuf>) -> Result<Arc<dyn SyncStore>> {
    Ok(match db {
        Some(path) => {
            info!("Using SQLite store at {}", path.display());
            Arc::new(SqliteSyncStore::new(path)?)
        }
        None => Arc::new(InMemorySyncStore::new()),
    })
}

fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let scheduler_config = load_config(args.config.as_ref())?;
    if args.write_config {
        scheduler_config.save()?;
        if let Some(path) = config::config_path(mailsync::SCHEDULER_CONFIG_FILE) {
            info!("Wrote scheduler config to {}", path.display());
        }
        return Ok(());
    }
    let fixture = Fixture::load(args.fixture.as_deref())?;
    let store = open_store(args.db.as_ref())?;
    fixture.seed(store.as_ref())?;

    let options = SimulationOptions {
        work: Duration::from_millis(args.work_ms),
        push_wait: Duration::from_secs(args.push_wait_secs),
        fail_every: args.fail_every,
    };
    let factory = Arc::new(SimulatedFactory::new(store.clone(), options, &fixture.outgoing));
    let alarms = Arc::new(TimerAlarmProvider::new().context("Failed to start alarm timer")?);

    let scheduler = Scheduler::builder(store, factory)
        .with_config(scheduler_config)
        .with_alarm_provider(alarms)
        .build();
    scheduler.register_observer(Arc::new(LoggingObserver));

    if args.offline_secs.is_some() {
        scheduler.signal_disconnected();
    }
    scheduler.start()?;
    info!("mailsyncd running");

    if let Some(secs) = args.offline_secs {
        thread::sleep(Duration::from_secs(secs));
        info!("Network is back");
        scheduler.signal_connected(NetworkInfo::default());
    }

    if args.run_secs == 0 {
        loop {
            thread::sleep(Duration::from_secs(3600));
            if scheduler.restart_requested() {
                break;
            }
        }
    } else {
        thread::sleep(Duration::from_secs(args.run_secs));
    }

    if scheduler.restart_requested() {
        warn!("Stopping after the scheduler requested a restart");
    }
    scheduler.stop();
    info!("mailsyncd stopped");
    Ok(())
}
