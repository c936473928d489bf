//! Domain models for accounts, mailboxes and sync requests

mod account;
mod mailbox;
mod request;

pub use account::{Account, AccountFlags, AccountId};
pub use mailbox::{Mailbox, MailboxId, MailboxType, SyncInterval};
pub use request::{MeetingResponse, SyncReason, SyncRequest};
