//! Error types for pool operations

/// Errors from rotation, token lifecycle and sync operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Store I/O or lock acquisition failed. Never swallowed by rotation.
    #[error("account store error: {0}")]
    Store(#[from] account_auth::Error),

    #[error("account {0} is flagged auth-invalid and needs a fresh login")]
    AuthInvalid(String),

    #[error("token refresh failed for {alias}: {reason}")]
    RefreshFailed { alias: String, reason: String },

    #[error("credential file sync failed: {0}")]
    Sync(String),
}

impl Error {
    /// Whether the failure is confined to one candidate account, so rotation
    /// can fall through to the next one.
    pub fn is_candidate_failure(&self) -> bool {
        matches!(self, Error::AuthInvalid(_) | Error::RefreshFailed { .. })
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
