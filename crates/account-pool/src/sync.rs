//! Import from an externally maintained credential file
//!
//! Another tool may keep its own login in a JSON file shaped like
//! `{"tokens": {"access_token", "refresh_token", "id_token", "account_id"}}`.
//! Each sync fingerprints the file and merges it into the store only when
//! the fingerprint changed. The last fingerprint and check time live in a
//! `SyncContext` owned by the caller, with a TTL that bounds how often the
//! file is re-read.

use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};

use account_auth::{AccountStore, IdTokenClaims, TokenBundle};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct AuthFile {
    tokens: AuthTokens,
}

#[derive(Debug, Deserialize)]
struct AuthTokens {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
}

/// Fingerprint cache for one synced file.
#[derive(Debug, Clone)]
pub struct SyncContext {
    ttl: Duration,
    last_fingerprint: Option<String>,
    last_checked: Option<Instant>,
}

impl SyncContext {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last_fingerprint: None,
            last_checked: None,
        }
    }

    /// Whether the last check is recent enough to skip reading the file.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.last_checked
            .is_some_and(|checked| now.duration_since(checked) < self.ttl)
    }

    /// Forget the cached check so the next sync re-reads the file.
    pub fn invalidate(&mut self) {
        self.last_checked = None;
    }

    pub fn last_fingerprint(&self) -> Option<&str> {
        self.last_fingerprint.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Checked within the TTL, or the content has not changed.
    Unchanged,
    /// New or changed credentials merged at `index`.
    Imported { index: usize },
    /// The file does not exist.
    Missing,
}

fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Merge the credential file at `path` into `store` if it changed since the
/// last sync recorded in `ctx`.
pub async fn sync_external_auth(
    path: &Path,
    store: &AccountStore,
    ctx: &mut SyncContext,
) -> Result<SyncOutcome> {
    let now = Instant::now();
    if ctx.is_fresh(now) {
        return Ok(SyncOutcome::Unchanged);
    }

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "external credential file not present");
            ctx.last_checked = Some(now);
            return Ok(SyncOutcome::Missing);
        }
        Err(e) => {
            return Err(Error::Sync(format!("reading {}: {e}", path.display())));
        }
    };
    ctx.last_checked = Some(now);

    let digest = fingerprint(&bytes);
    if ctx.last_fingerprint.as_deref() == Some(digest.as_str()) {
        return Ok(SyncOutcome::Unchanged);
    }

    let file: AuthFile = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Sync(format!("parsing {}: {e}", path.display())))?;
    let tokens = file.tokens;

    // Unknown expiry is treated as already expired, forcing a refresh on use
    let expires_at = IdTokenClaims::decode(&tokens.access_token)
        .and_then(|c| c.expires_at)
        .unwrap_or(0);

    let bundle = TokenBundle {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        id_token: tokens.id_token,
        expires_at,
        email: None,
        account_id: tokens.account_id,
    };
    let index = store.add_or_merge(bundle).await?;
    ctx.last_fingerprint = Some(digest);
    info!(path = %path.display(), index, "imported external credentials");
    Ok(SyncOutcome::Imported { index })
}
