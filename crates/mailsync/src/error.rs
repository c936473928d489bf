//! Error and outcome types shared by the scheduler and its collaborators

use serde::{Deserialize, Serialize};

use crate::models::MailboxId;

/// How a worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitOutcome {
    /// Sync completed (or was stopped cleanly)
    Done,
    /// Network or server I/O failed; retried with backoff
    IoError,
    /// Credentials were rejected
    LoginFailure,
    /// Security policies must be accepted first
    SecurityFailure,
    /// The server refused access to the account or folder
    AccessDenied,
    /// Unexpected failure inside the worker
    InternalError,
}

impl ExitOutcome {
    /// The hold reason this outcome leaves behind, if any
    pub fn error_reason(&self) -> Option<SyncErrorReason> {
        match self {
            ExitOutcome::Done => None,
            ExitOutcome::IoError => Some(SyncErrorReason::IoError),
            ExitOutcome::LoginFailure => Some(SyncErrorReason::LoginFailure),
            ExitOutcome::SecurityFailure => Some(SyncErrorReason::SecurityFailure),
            ExitOutcome::AccessDenied => Some(SyncErrorReason::AccessDenied),
            ExitOutcome::InternalError => Some(SyncErrorReason::InternalError),
        }
    }
}

/// Why a mailbox is held back from scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncErrorReason {
    IoError,
    LoginFailure,
    SecurityFailure,
    AccessDenied,
    InternalError,
}

impl SyncErrorReason {
    /// Transient failures are retried automatically with exponential backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncErrorReason::IoError)
    }
}

/// The account/mailbox store cannot be reached at all
///
/// Stores return this inside their `anyhow::Error`; the scheduler downcasts
/// to it and treats it as fatal for the whole loop.
#[derive(Debug, thiserror::Error)]
#[error("Mailbox store unavailable")]
pub struct ProviderUnavailableError;

/// Check whether an error chain carries [`ProviderUnavailableError`]
pub fn is_provider_unavailable(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ProviderUnavailableError>().is_some())
}

/// Errors surfaced by the scheduler API
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("A worker is already running for mailbox {0}")]
    AlreadyRunning(MailboxId),

    #[error("Mailbox store unavailable")]
    ProviderUnavailable,

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Scheduler is already running")]
    AlreadyStarted,

    #[error("Store error: {0}")]
    Store(anyhow::Error),

    #[error("Worker could not be created: {0}")]
    Worker(anyhow::Error),
}

impl SchedulerError {
    /// Classify a store error, promoting provider unavailability
    pub fn from_store(err: anyhow::Error) -> Self {
        if is_provider_unavailable(&err) {
            SchedulerError::ProviderUnavailable
        } else {
            SchedulerError::Store(err)
        }
    }
}
