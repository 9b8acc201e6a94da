//! Proactive background token refresh
//!
//! Spawns a periodic task that refreshes tokens approaching expiration, so
//! most selections find a valid token without waiting on the token
//! endpoint. Refreshes go through `TokenLifecycleManager`, which shares its
//! refresh gate with the request path.

use std::sync::Arc;
use std::time::Duration;

use account_auth::now_millis;
use tracing::{debug, info, warn};

use crate::lifecycle::TokenLifecycleManager;

/// Spawn a background task that proactively refreshes expiring tokens.
///
/// Runs every `interval` and refreshes any token expiring within `threshold`.
/// A rejected refresh token marks the account auth-invalid; transient
/// failures leave it unchanged for the next cycle.
pub fn spawn_refresh_task(
    lifecycle: Arc<TokenLifecycleManager>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; selection refreshes on demand at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&lifecycle, threshold).await;
        }
    })
}

/// One pass over the store. Returns how many tokens were refreshed.
pub async fn refresh_cycle(lifecycle: &TokenLifecycleManager, threshold: Duration) -> usize {
    let snapshot = lifecycle.store().load().await;
    let threshold_ms = threshold.as_millis() as u64;
    let now = now_millis();
    let mut refreshed = 0;

    for (index, account) in snapshot.accounts.iter().enumerate() {
        // Invalid accounts wait for a fresh login
        if account.auth_invalid || account.expires_at > now.saturating_add(threshold_ms) {
            continue;
        }

        debug!(account = account.alias(), "token expiring within threshold, refreshing");
        match lifecycle
            .ensure_valid_within(account, Some(index), threshold_ms)
            .await
        {
            Ok(_) => refreshed += 1,
            Err(e) => {
                warn!(account = account.alias(), error = %e, "background refresh failed, will retry next cycle");
            }
        }
    }

    if refreshed > 0 {
        info!(refreshed, "background refresh cycle complete");
    }
    refreshed
}
