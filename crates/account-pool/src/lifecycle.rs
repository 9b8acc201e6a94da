//! Token lifecycle: hand out a currently valid bearer token
//!
//! `ensure_valid` returns the cached access token while it is outside the
//! safety buffer and otherwise exchanges the refresh token. The store is
//! re-read at call time rather than trusting the caller's copy, so a refresh
//! already performed by another caller or process is picked up instead of
//! repeated. Refreshes inside one process are serialized by a gate; the
//! store lock itself is only taken to persist the outcome, never across the
//! network exchange.
//!
//! A rejected refresh token marks the account `auth_invalid` and fails
//! without retrying. Falling through to another account is the rotation
//! engine's job.

use std::sync::Arc;

use account_auth::{
    Account, AccountIdentity, AccountStore, EXPIRY_SAFETY_BUFFER_MS, RefreshError,
    RefreshTransport, TokenBundle, now_millis,
};
use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Keeps account tokens fresh and persists every token change.
pub struct TokenLifecycleManager {
    store: Arc<AccountStore>,
    transport: Arc<dyn RefreshTransport>,
    refresh_gate: Mutex<()>,
}

impl TokenLifecycleManager {
    pub fn new(store: Arc<AccountStore>, transport: Arc<dyn RefreshTransport>) -> Self {
        Self {
            store,
            transport,
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.store
    }

    /// Valid access token for `account`, refreshing inside the 5 minute buffer.
    pub async fn ensure_valid(&self, account: &Account) -> Result<Secret<String>> {
        self.ensure_valid_within(account, None, EXPIRY_SAFETY_BUFFER_MS)
            .await
    }

    /// Like `ensure_valid` with an explicit buffer and a position hint for
    /// finding the record in the store.
    pub async fn ensure_valid_within(
        &self,
        account: &Account,
        hint: Option<usize>,
        buffer_ms: u64,
    ) -> Result<Secret<String>> {
        let identity = account.identity();
        let current = self
            .current(&identity, hint)
            .await
            .unwrap_or_else(|| account.clone());
        if current.expires_at > now_millis().saturating_add(buffer_ms) {
            return Ok(Secret::new(current.access_token));
        }

        let _gate = self.refresh_gate.lock().await;
        // Another task may have refreshed while this one waited on the gate
        let current = self.current(&identity, hint).await.unwrap_or(current);
        if current.expires_at > now_millis().saturating_add(buffer_ms) {
            debug!(account = current.alias(), "token refreshed concurrently, reusing");
            return Ok(Secret::new(current.access_token));
        }

        self.refresh(&current, &identity, hint).await
    }

    /// Persist a bundle from an interactive or device-code login. The store
    /// treats both acquisition paths identically.
    pub async fn persist_login(&self, bundle: TokenBundle) -> Result<usize> {
        Ok(self.store.add_or_merge(bundle).await?)
    }

    async fn current(&self, identity: &AccountIdentity, hint: Option<usize>) -> Option<Account> {
        let store = self.store.load().await;
        store
            .locate(identity, hint)
            .and_then(|i| store.get(i).cloned())
    }

    async fn refresh(
        &self,
        account: &Account,
        identity: &AccountIdentity,
        hint: Option<usize>,
    ) -> Result<Secret<String>> {
        let alias = account.alias().to_string();
        debug!(account = %alias, "token inside refresh window, exchanging refresh token");

        match self.transport.refresh(&account.refresh_token).await {
            Ok(bundle) => {
                let token = Secret::new(bundle.access_token.clone());
                self.store
                    .update_by_identity(identity, hint, |a| a.apply_bundle(bundle))
                    .await?;
                metrics::counter!("token_refresh_total", "result" => "success").increment(1);
                info!(account = %alias, "token refresh succeeded");
                Ok(token)
            }
            Err(RefreshError::Unauthorized(reason)) => {
                metrics::counter!("token_refresh_total", "result" => "unauthorized").increment(1);
                warn!(account = %alias, error = %reason, "refresh token rejected, marking account auth-invalid");
                self.store
                    .update_by_identity(identity, hint, |a| a.auth_invalid = true)
                    .await?;
                Err(Error::AuthInvalid(alias))
            }
            Err(RefreshError::Transient(reason)) => {
                metrics::counter!("token_refresh_total", "result" => "transient").increment(1);
                warn!(account = %alias, error = %reason, "token refresh failed (transient)");
                Err(Error::RefreshFailed { alias, reason })
            }
        }
    }
}
