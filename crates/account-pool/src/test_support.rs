//! Shared fixtures for pool tests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use account_auth::{
    Account, AccountStore, RefreshError, RefreshFuture, RefreshTransport, Store, TokenBundle,
    now_millis,
};

/// Expiration far in the future (year 2100).
pub(crate) const FUTURE_EXPIRY: u64 = 4_102_444_800_000;

/// Refresh transport answering from a script keyed by refresh token.
#[derive(Default)]
pub(crate) struct FakeTransport {
    script: Mutex<HashMap<String, Result<TokenBundle, RefreshError>>>,
    calls: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, refresh_token: &str, outcome: Result<TokenBundle, RefreshError>) {
        self.script
            .lock()
            .unwrap()
            .insert(refresh_token.to_string(), outcome);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RefreshTransport for FakeTransport {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> RefreshFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent callers genuinely interleave
            tokio::task::yield_now().await;
            self.script
                .lock()
                .unwrap()
                .get(refresh_token)
                .cloned()
                .unwrap_or_else(|| Err(RefreshError::Transient("no scripted response".into())))
        })
    }
}

/// A freshly issued bundle for `suffix`.
pub(crate) fn issued(suffix: &str) -> TokenBundle {
    TokenBundle {
        access_token: format!("at_{suffix}"),
        refresh_token: format!("rt_{suffix}"),
        id_token: None,
        expires_at: now_millis() + 3_600_000,
        email: None,
        account_id: None,
    }
}

/// An account named `name` (email `name@example.com`) expiring at `expires_at`.
pub(crate) fn account(name: &str, expires_at: u64) -> Account {
    let bundle = TokenBundle {
        access_token: format!("at_{name}"),
        refresh_token: format!("rt_{name}"),
        id_token: None,
        expires_at,
        email: Some(format!("{name}@example.com")),
        account_id: None,
    };
    Account::from_bundle(bundle, 1_000)
}

/// Write `accounts` into a new store file under `dir`.
pub(crate) async fn seed(dir: &tempfile::TempDir, accounts: Vec<Account>) -> Arc<AccountStore> {
    let store = AccountStore::new(dir.path().join("accounts.json"));
    let mut snapshot = Store {
        accounts,
        active_index: 0,
        rotation_index: 0,
        ..Store::default()
    };
    snapshot.normalize();
    store.save(&snapshot).await.unwrap();
    Arc::new(store)
}
