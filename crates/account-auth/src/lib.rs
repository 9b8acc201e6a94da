//! OAuth account storage and token exchange
//!
//! Durable, lock-protected storage for a pool of OAuth accounts plus the
//! refresh-token transport the lifecycle manager calls. This crate has no
//! knowledge of rotation policy; it only guarantees that the store file is
//! consistent across processes.
//!
//! Store flow:
//! 1. A login collaborator produces a `TokenBundle`
//! 2. `AccountStore::add_or_merge()` inserts it, de-duplicated by email
//! 3. Every later mutation goes through `AccountStore::with_exclusive_lock()`
//! 4. `RefreshTransport::refresh()` exchanges refresh tokens for new bundles

pub mod account;
pub mod claims;
pub mod constants;
pub mod error;
pub mod lock;
pub mod schema;
pub mod store;
pub mod token;

pub use account::{
    Account, AccountIdentity, LimitStatus, RateLimitWindow, RateLimits, now_millis,
};
pub use claims::IdTokenClaims;
pub use constants::*;
pub use error::{Error, RefreshError, Result};
pub use lock::{LockOptions, StoreLock};
pub use schema::{Store, StoreShape};
pub use store::AccountStore;
pub use token::{HttpRefreshTransport, RefreshFuture, RefreshTransport, TokenBundle, TokenResponse};
