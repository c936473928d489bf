//! Mailbox model: a single syncable folder belonging to an account

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::AccountId;

/// Unique identifier for a mailbox (store primary key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailboxId(pub i64);

impl MailboxId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MailboxId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Kind of mailbox, which decides how the scheduler treats it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MailboxType {
    Inbox,
    Outbox,
    Drafts,
    Contacts,
    Calendar,
    /// Hidden per-account mailbox that carries the account-wide ping
    AccountRoot,
    Trash,
    Other,
}

impl MailboxType {
    /// Stable string form used by persistent stores
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxType::Inbox => "inbox",
            MailboxType::Outbox => "outbox",
            MailboxType::Drafts => "drafts",
            MailboxType::Contacts => "contacts",
            MailboxType::Calendar => "calendar",
            MailboxType::AccountRoot => "account-root",
            MailboxType::Trash => "trash",
            MailboxType::Other => "other",
        }
    }

    /// Parse the stable string form; unknown kinds map to `Other`
    pub fn parse(s: &str) -> Self {
        match s {
            "inbox" => MailboxType::Inbox,
            "outbox" => MailboxType::Outbox,
            "drafts" => MailboxType::Drafts,
            "contacts" => MailboxType::Contacts,
            "calendar" => MailboxType::Calendar,
            "account-root" => MailboxType::AccountRoot,
            "trash" => MailboxType::Trash,
            _ => MailboxType::Other,
        }
    }
}

/// How often a mailbox is synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncInterval {
    /// Never synced automatically
    Never,
    /// Long-lived worker that blocks server-side waiting for changes
    Push,
    /// Watched by the account-root worker's ping
    Ping,
    /// Push temporarily suspended (e.g. during a folder list reload)
    PushHold,
    /// Polled every N minutes
    Minutes(u32),
}

impl SyncInterval {
    const RAW_NEVER: i64 = -1;
    const RAW_PUSH: i64 = -2;
    const RAW_PING: i64 = -3;
    const RAW_PUSH_HOLD: i64 = -4;

    /// Integer encoding used by persistent stores
    pub fn to_raw(self) -> i64 {
        match self {
            SyncInterval::Never => Self::RAW_NEVER,
            SyncInterval::Push => Self::RAW_PUSH,
            SyncInterval::Ping => Self::RAW_PING,
            SyncInterval::PushHold => Self::RAW_PUSH_HOLD,
            SyncInterval::Minutes(n) => n as i64,
        }
    }

    /// Decode the integer encoding; zero and unknown negatives mean `Never`
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            Self::RAW_PUSH => SyncInterval::Push,
            Self::RAW_PING => SyncInterval::Ping,
            Self::RAW_PUSH_HOLD => SyncInterval::PushHold,
            n if n > 0 => SyncInterval::Minutes(u32::try_from(n).unwrap_or(u32::MAX)),
            _ => SyncInterval::Never,
        }
    }
}

/// A syncable folder or resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub account_id: AccountId,
    pub kind: MailboxType,
    pub interval: SyncInterval,
    /// When the last sync completed (None if never synced)
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    /// Server-assigned sync cursor
    #[serde(default)]
    pub sync_key: Option<String>,
    pub display_name: String,
}

impl Mailbox {
    pub fn new(
        id: MailboxId,
        account_id: AccountId,
        kind: MailboxType,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            account_id,
            kind,
            interval: SyncInterval::Never,
            last_sync: None,
            sync_key: None,
            display_name: display_name.into(),
        }
    }

    /// Set sync interval
    pub fn with_interval(mut self, interval: SyncInterval) -> Self {
        self.interval = interval;
        self
    }

    /// Set last sync time
    pub fn with_last_sync(mut self, last_sync: DateTime<Utc>) -> Self {
        self.last_sync = Some(last_sync);
        self
    }

    /// Set sync key
    pub fn with_sync_key(mut self, sync_key: impl Into<String>) -> Self {
        self.sync_key = Some(sync_key.into());
        self
    }

    /// When a fixed-interval mailbox is next due
    ///
    /// Returns `None` for non-interval modes. A mailbox that has never synced
    /// is due at the Unix epoch, i.e. immediately.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        match self.interval {
            SyncInterval::Minutes(n) => {
                let last = self.last_sync.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                Some(last + Duration::minutes(n as i64))
            }
            _ => None,
        }
    }

    /// Name used for worker threads and logs: "Inbox[account]"
    pub fn thread_name(&self, account_name: &str) -> String {
        format!("{}[{}]", self.display_name, account_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_raw_round_trip() {
        for interval in [
            SyncInterval::Never,
            SyncInterval::Push,
            SyncInterval::Ping,
            SyncInterval::PushHold,
            SyncInterval::Minutes(30),
        ] {
            assert_eq!(SyncInterval::from_raw(interval.to_raw()), interval);
        }
    }

    #[test]
    fn test_interval_from_raw_unknown_is_never() {
        assert_eq!(SyncInterval::from_raw(0), SyncInterval::Never);
        assert_eq!(SyncInterval::from_raw(-42), SyncInterval::Never);
    }

    #[test]
    fn test_interval_serde_forms() {
        assert_eq!(serde_json::to_string(&SyncInterval::PushHold).unwrap(), "\"push-hold\"");
        let parsed: SyncInterval = serde_json::from_str(r#"{"minutes":30}"#).unwrap();
        assert_eq!(parsed, SyncInterval::Minutes(30));
    }

    #[test]
    fn test_next_due() {
        let last = Utc::now() - Duration::minutes(31);
        let mailbox = Mailbox::new(MailboxId::new(1), AccountId::new(1), MailboxType::Inbox, "Inbox")
            .with_interval(SyncInterval::Minutes(30))
            .with_last_sync(last);
        assert_eq!(mailbox.next_due(), Some(last + Duration::minutes(30)));

        let push = mailbox.clone().with_interval(SyncInterval::Push);
        assert_eq!(push.next_due(), None);
    }

    #[test]
    fn test_never_synced_is_due_immediately() {
        let mailbox = Mailbox::new(MailboxId::new(1), AccountId::new(1), MailboxType::Inbox, "Inbox")
            .with_interval(SyncInterval::Minutes(5));
        assert!(mailbox.next_due().unwrap() <= Utc::now());
    }

    #[test]
    fn test_mailbox_type_string_form() {
        assert_eq!(MailboxType::parse(MailboxType::AccountRoot.as_str()), MailboxType::AccountRoot);
        assert_eq!(MailboxType::parse("sent"), MailboxType::Other);
    }
}
