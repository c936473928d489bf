//! SQLite-based account/mailbox storage

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::traits::{MailboxFilter, StoreChange, StoreListener, SyncStore};
use crate::error::ProviderUnavailableError;
use crate::models::{
    Account, AccountFlags, AccountId, Mailbox, MailboxId, MailboxType, SyncInterval,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                email TEXT NOT NULL,
                sync_interval INTEGER NOT NULL,
                sync_lookback_days INTEGER NOT NULL DEFAULT 3,
                security_hold INTEGER NOT NULL DEFAULT 0,
                sync_disabled INTEGER NOT NULL DEFAULT 0,
                incomplete INTEGER NOT NULL DEFAULT 0,
                sync_email INTEGER NOT NULL DEFAULT 1,
                sync_contacts INTEGER NOT NULL DEFAULT 1,
                sync_calendar INTEGER NOT NULL DEFAULT 1,
                manual_sync_when_roaming INTEGER NOT NULL DEFAULT 0,
                credentials_ref TEXT,
                host TEXT NOT NULL DEFAULT ''
            );

            -- Interval uses the raw encoding: -1 never, -2 push, -3 ping,
            -- -4 push-hold, N > 0 minutes
            CREATE TABLE mailboxes (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                sync_interval INTEGER NOT NULL DEFAULT -1,
                last_sync TEXT,
                sync_key TEXT,
                display_name TEXT NOT NULL
            );

            CREATE INDEX idx_mailboxes_account ON mailboxes(account_id);
            "#,
        ),
        // Migration 2: Outgoing queue
        M::up(
            r#"
            CREATE TABLE outgoing (
                mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
                message_id INTEGER NOT NULL,
                send_failed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (mailbox_id, message_id)
            );
            "#,
        ),
    ])
}

const ACCOUNT_COLUMNS: &str = "id, display_name, email, sync_interval, sync_lookback_days,
    security_hold, sync_disabled, incomplete, sync_email, sync_contacts, sync_calendar,
    manual_sync_when_roaming, credentials_ref, host";

const MAILBOX_COLUMNS: &str =
    "id, account_id, kind, sync_interval, last_sync, sync_key, display_name";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: AccountId::new(row.get(0)?),
        display_name: row.get(1)?,
        email: row.get(2)?,
        sync_interval: SyncInterval::from_raw(row.get(3)?),
        sync_lookback_days: row.get(4)?,
        flags: AccountFlags {
            security_hold: row.get(5)?,
            sync_disabled: row.get(6)?,
            incomplete: row.get(7)?,
        },
        sync_email: row.get(8)?,
        sync_contacts: row.get(9)?,
        sync_calendar: row.get(10)?,
        manual_sync_when_roaming: row.get(11)?,
        credentials_ref: row.get(12)?,
        host: row.get(13)?,
    })
}

fn mailbox_from_row(row: &Row<'_>) -> rusqlite::Result<Mailbox> {
    // An unparseable timestamp reads as "never synced", which only makes the
    // mailbox due sooner
    let last_sync = row
        .get::<_, Option<String>>(4)?
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(Mailbox {
        id: MailboxId::new(row.get(0)?),
        account_id: AccountId::new(row.get(1)?),
        kind: MailboxType::parse(&row.get::<_, String>(2)?),
        interval: SyncInterval::from_raw(row.get(3)?),
        last_sync,
        sync_key: row.get(5)?,
        display_name: row.get(6)?,
    })
}

/// Promote errors that mean the database itself is gone or unusable
fn classify(err: rusqlite::Error) -> anyhow::Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt) => {
            anyhow::Error::new(ProviderUnavailableError).context(err.to_string())
        }
        _ => err.into(),
    }
}

/// SQLite-based account/mailbox storage
pub struct SqliteSyncStore {
    conn: Mutex<Connection>,
    listeners: RwLock<Vec<Arc<dyn StoreListener>>>,
}

impl SqliteSyncStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// Create a store backed by a private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets the scheduler read while a worker writes; foreign keys are
        // needed for the cascading deletes
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
            listeners: RwLock::new(Vec::new()),
        })
    }

    fn notify(&self, change: StoreChange) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.on_store_change(change);
        }
    }
}

impl SyncStore for SqliteSyncStore {
    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"))
            .map_err(classify)?;
        let accounts = stmt
            .query_map([], account_from_row)
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"),
            [id.as_i64()],
            account_from_row,
        )
        .optional()
        .map_err(classify)
    }

    fn list_syncable_mailboxes(&self, filter: &MailboxFilter) -> Result<Vec<Mailbox>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MAILBOX_COLUMNS} FROM mailboxes
                 WHERE (?1 OR sync_interval != ?2 OR kind = ?5)
                   AND (?3 IS NULL OR account_id = ?3)
                   AND (?4 IS NULL OR kind = ?4)
                 ORDER BY id"
            ))
            .map_err(classify)?;
        let mailboxes = stmt
            .query_map(
                params![
                    filter.include_never,
                    SyncInterval::Never.to_raw(),
                    filter.account_id.map(|id| id.as_i64()),
                    filter.kind.map(|kind| kind.as_str()),
                    MailboxType::Outbox.as_str(),
                ],
                mailbox_from_row,
            )
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mailboxes)
    }

    fn get_mailbox(&self, id: MailboxId) -> Result<Option<Mailbox>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = ?"),
            [id.as_i64()],
            mailbox_from_row,
        )
        .optional()
        .map_err(classify)
    }

    fn has_sendable_items(&self, outbox: MailboxId) -> Result<bool> {
        let conn = self.conn.lock();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM outgoing WHERE mailbox_id = ? AND send_failed = 0)",
                [outbox.as_i64()],
                |row| row.get(0),
            )
            .map_err(classify)?;
        Ok(exists)
    }

    fn reset_send_failures(&self, outbox: MailboxId) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE outgoing SET send_failed = 0 WHERE mailbox_id = ?",
                [outbox.as_i64()],
            )
            .map_err(classify)?;
        }
        self.notify(StoreChange::Outgoing(outbox));
        Ok(())
    }

    fn update_inbox_interval(&self, account_id: AccountId, interval: SyncInterval) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE mailboxes SET sync_interval = ? WHERE account_id = ? AND kind = ?",
                params![
                    interval.to_raw(),
                    account_id.as_i64(),
                    MailboxType::Inbox.as_str()
                ],
            )
            .map_err(classify)?;
        }
        self.notify(StoreChange::Mailboxes);
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn StoreListener>) {
        self.listeners.write().push(listener);
    }

    fn upsert_account(&self, account: Account) -> Result<()> {
        {
            let conn = self.conn.lock();
            // ON CONFLICT DO UPDATE keeps the row, so mailboxes are not cascaded away
            conn.execute(
                &format!(
                    "INSERT INTO accounts ({ACCOUNT_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        display_name = excluded.display_name,
                        email = excluded.email,
                        sync_interval = excluded.sync_interval,
                        sync_lookback_days = excluded.sync_lookback_days,
                        security_hold = excluded.security_hold,
                        sync_disabled = excluded.sync_disabled,
                        incomplete = excluded.incomplete,
                        sync_email = excluded.sync_email,
                        sync_contacts = excluded.sync_contacts,
                        sync_calendar = excluded.sync_calendar,
                        manual_sync_when_roaming = excluded.manual_sync_when_roaming,
                        credentials_ref = excluded.credentials_ref,
                        host = excluded.host"
                ),
                params![
                    account.id.as_i64(),
                    account.display_name,
                    account.email,
                    account.sync_interval.to_raw(),
                    account.sync_lookback_days,
                    account.flags.security_hold,
                    account.flags.sync_disabled,
                    account.flags.incomplete,
                    account.sync_email,
                    account.sync_contacts,
                    account.sync_calendar,
                    account.manual_sync_when_roaming,
                    account.credentials_ref,
                    account.host,
                ],
            )
            .map_err(classify)?;
        }
        self.notify(StoreChange::Accounts);
        Ok(())
    }

    fn delete_account(&self, id: AccountId) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM accounts WHERE id = ?", [id.as_i64()])
                .map_err(classify)?;
        }
        self.notify(StoreChange::Accounts);
        self.notify(StoreChange::Mailboxes);
        Ok(())
    }

    fn upsert_mailbox(&self, mailbox: Mailbox) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO mailboxes ({MAILBOX_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        account_id = excluded.account_id,
                        kind = excluded.kind,
                        sync_interval = excluded.sync_interval,
                        last_sync = excluded.last_sync,
                        sync_key = excluded.sync_key,
                        display_name = excluded.display_name"
                ),
                params![
                    mailbox.id.as_i64(),
                    mailbox.account_id.as_i64(),
                    mailbox.kind.as_str(),
                    mailbox.interval.to_raw(),
                    mailbox.last_sync.map(|t| t.to_rfc3339()),
                    mailbox.sync_key,
                    mailbox.display_name,
                ],
            )
            .with_context(|| format!("Failed to upsert mailbox {}", mailbox.id))?;
        }
        self.notify(StoreChange::Mailboxes);
        Ok(())
    }

    fn delete_mailbox(&self, id: MailboxId) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM mailboxes WHERE id = ?", [id.as_i64()])
                .map_err(classify)?;
        }
        self.notify(StoreChange::Mailboxes);
        Ok(())
    }

    fn queue_outgoing(&self, outbox: MailboxId, message_id: i64) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO outgoing (mailbox_id, message_id, send_failed) VALUES (?, ?, 0)
                 ON CONFLICT(mailbox_id, message_id) DO UPDATE SET send_failed = 0",
                params![outbox.as_i64(), message_id],
            )
            .with_context(|| format!("Failed to queue message {message_id} in {outbox}"))?;
        }
        self.notify(StoreChange::Outgoing(outbox));
        Ok(())
    }

    fn mark_send_failed(&self, outbox: MailboxId, message_id: i64) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE outgoing SET send_failed = 1 WHERE mailbox_id = ? AND message_id = ?",
                params![outbox.as_i64(), message_id],
            )
            .map_err(classify)?;
        }
        self.notify(StoreChange::Outgoing(outbox));
        Ok(())
    }

    fn remove_outgoing(&self, outbox: MailboxId, message_id: i64) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "DELETE FROM outgoing WHERE mailbox_id = ? AND message_id = ?",
                params![outbox.as_i64(), message_id],
            )
            .map_err(classify)?;
        }
        self.notify(StoreChange::Outgoing(outbox));
        Ok(())
    }
}
