//! JSON fixture describing the accounts and mailboxes to seed a store with

use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use mailsync::{Account, Mailbox, MailboxId, SyncStore};
use serde::{Deserialize, Serialize};

/// Built-in fixture used when no file is given
pub const DEMO_FIXTURE: &str = include_str!("../fixtures/demo.json");

/// A message waiting in an outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub outbox: MailboxId,
    pub message_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub mailboxes: Vec<Mailbox>,
    #[serde(default)]
    pub outgoing: Vec<OutgoingMessage>,
}

impl Fixture {
    /// Load from a file, or the built-in demo when `path` is `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => config::load_json_file(path),
            None => Self::from_json(DEMO_FIXTURE),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse fixture")
    }

    /// Write everything into `store`
    ///
    /// Mailboxes referring to an account missing from the fixture are still
    /// stored; the scheduler ignores them until the account shows up.
    pub fn seed(&self, store: &dyn SyncStore) -> Result<()> {
        for account in &self.accounts {
            store
                .upsert_account(account.clone())
                .with_context(|| format!("Failed to seed account {}", account.id))?;
        }
        for mailbox in &self.mailboxes {
            store
                .upsert_mailbox(mailbox.clone())
                .with_context(|| format!("Failed to seed mailbox {}", mailbox.id))?;
        }
        for message in &self.outgoing {
            store.queue_outgoing(message.outbox, message.message_id)?;
        }
        info!(
            "Seeded {} accounts, {} mailboxes, {} outgoing messages",
            self.accounts.len(),
            self.mailboxes.len(),
            self.outgoing.len()
        );
        Ok(())
    }
}
