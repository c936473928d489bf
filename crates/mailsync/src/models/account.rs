//! Account model as cached by the scheduler

use serde::{Deserialize, Serialize};
use std::fmt;

use super::SyncInterval;

/// Unique identifier for an account (store primary key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl AccountId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AccountId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Policy holds placed on an account by the credential/policy authority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFlags {
    /// Security policies must be accepted before syncing resumes
    #[serde(default)]
    pub security_hold: bool,
    /// Sync was disabled by the server or an administrator
    #[serde(default)]
    pub sync_disabled: bool,
    /// Account setup has not finished; absence from the store is not a deletion
    #[serde(default)]
    pub incomplete: bool,
}

/// A mail account whose mailboxes the scheduler is responsible for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub display_name: String,
    pub email: String,
    /// Interval applied to the account's inbox
    pub sync_interval: SyncInterval,
    /// How far back (in days) the protocol layer should look when syncing
    #[serde(default = "default_lookback")]
    pub sync_lookback_days: u32,
    #[serde(default)]
    pub flags: AccountFlags,
    /// "Sync automatically" for mail folders
    #[serde(default = "default_true")]
    pub sync_email: bool,
    /// "Sync automatically" for the contacts folder
    #[serde(default = "default_true")]
    pub sync_contacts: bool,
    /// "Sync automatically" for the calendar folder
    #[serde(default = "default_true")]
    pub sync_calendar: bool,
    /// Policy: only manual syncs while roaming
    #[serde(default)]
    pub manual_sync_when_roaming: bool,
    /// Reference to credentials held by the credential authority
    #[serde(default)]
    pub credentials_ref: Option<String>,
    /// Server host; a change releases every hold of the account
    #[serde(default)]
    pub host: String,
}

fn default_lookback() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Account {
    /// Create an account with default settings (push inbox, everything synced)
    pub fn new(id: AccountId, email: impl Into<String>) -> Self {
        let email = email.into();
        Self {
            id,
            display_name: email.clone(),
            email,
            sync_interval: SyncInterval::Push,
            sync_lookback_days: default_lookback(),
            flags: AccountFlags::default(),
            sync_email: true,
            sync_contacts: true,
            sync_calendar: true,
            manual_sync_when_roaming: false,
            credentials_ref: None,
            host: String::new(),
        }
    }

    /// Set display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the inbox sync interval
    pub fn with_sync_interval(mut self, interval: SyncInterval) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set policy hold flags
    pub fn with_flags(mut self, flags: AccountFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the server host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn on_security_hold(&self) -> bool {
        self.flags.security_hold
    }

    pub fn on_sync_disabled_hold(&self) -> bool {
        self.flags.sync_disabled
    }
}
