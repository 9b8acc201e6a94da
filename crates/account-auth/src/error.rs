//! Error types for credential storage and token refresh

use std::time::Duration;

/// Errors from the account store and the refresh transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account store serialization failed: {0}")]
    Serialize(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("timed out after {waited:?} waiting for store lock {path}")]
    LockTimeout { path: String, waited: Duration },
}

/// Result alias for store and auth operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed failure from a refresh-token exchange.
///
/// `Unauthorized` means the provider rejected the refresh token (401/403)
/// and the account needs a fresh login. `Transient` covers network errors,
/// timeouts and 5xx responses; nothing about the account changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh token rejected: {0}")]
    Unauthorized(String),

    #[error("transient refresh failure: {0}")]
    Transient(String),
}
