//! Why a sync runs and what out-of-band work it carries

use serde::{Deserialize, Serialize};

/// Why a worker was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncReason {
    /// Outgoing changes or queued mail must be sent
    Upsync,
    /// A fixed-interval mailbox came due
    Scheduled,
    /// A push mailbox needs its long-lived worker
    Push,
    /// The account ping reported changes
    Ping,
    /// Explicit kick from a collaborator
    Kick,
    /// A part (attachment, meeting response) was requested
    PartRequest,
    /// Started on behalf of another service; expects status callbacks
    ServiceStart,
    /// Started by the user; expects status callbacks
    UiRequest,
}

impl SyncReason {
    /// Whether the requester is waiting for status callbacks
    pub fn is_callback(&self) -> bool {
        matches!(self, SyncReason::ServiceStart | SyncReason::UiRequest)
    }
}

/// Meeting response choices forwarded to the protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeetingResponse {
    Accept,
    Tentative,
    Decline,
}

/// Out-of-band work handed to a running (or starting) worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum SyncRequest {
    /// Send local changes now
    Upsync,
    /// Fetch an attachment body
    LoadAttachment { attachment_id: i64 },
    /// Reply to a meeting invitation
    MeetingResponse {
        message_id: i64,
        response: MeetingResponse,
    },
}
