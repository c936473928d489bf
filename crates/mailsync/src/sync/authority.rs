//! Credential and policy authority contract

use crate::error::SyncErrorReason;
use crate::models::AccountId;

/// Told about authentication and policy outcomes so it can prompt the user
/// or refresh credentials
pub trait CredentialAuthority: Send + Sync {
    /// A worker's credentials were rejected
    fn on_login_failed(&self, _account_id: AccountId) {}

    /// A sync succeeded on an account that had a login hold
    fn on_login_succeeded(&self, _account_id: AccountId) {}

    /// A worker ended with a non-login fatal error
    fn on_fatal_error(&self, _account_id: AccountId, _reason: SyncErrorReason) {}
}

/// Authority that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuthority;

impl CredentialAuthority for NoopAuthority {}
