//! Durable account store
//!
//! A JSON file holding the versioned `Store`. Every mutation runs as a
//! read-mutate-write transaction under the cross-process `StoreLock`: the
//! file is re-read after the lock is taken, the closure mutates the fresh
//! snapshot, the result is normalized and written atomically (temp file +
//! rename, mode 0600), and the lock is released on every exit path.
//!
//! Plain `load()` calls take no lock and may observe a slightly stale file.
//! They never fail: a missing or unreadable file loads as an empty store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountIdentity, normalize_email, now_millis};
use crate::error::{Error, Result};
use crate::lock::{LockOptions, StoreLock};
use crate::schema::{Store, StoreShape};
use crate::token::TokenBundle;

/// File-backed account collection.
#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
    lock_options: LockOptions,
}

impl AccountStore {
    pub fn new(path: PathBuf) -> Self {
        Self::with_lock_options(path, LockOptions::default())
    }

    pub fn with_lock_options(path: PathBuf, lock_options: LockOptions) -> Self {
        Self { path, lock_options }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a normalized snapshot without locking.
    pub async fn load(&self) -> Store {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "store file not found, using empty store");
                return Store::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "store file unreadable, using empty store");
                return Store::default();
            }
        };

        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => StoreShape::classify(value).into_store(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "store file corrupt, using empty store");
                Store::default()
            }
        }
    }

    /// Overwrite the store file atomically.
    pub async fn save(&self, store: &Store) -> Result<()> {
        write_atomic(&self.path, store).await
    }

    /// Run `f` against a freshly loaded snapshot while holding the lock.
    ///
    /// On `Ok` the snapshot is normalized and persisted; on `Err` nothing is
    /// written. The lock is released whichever way the closure exits.
    pub async fn with_exclusive_lock<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Store) -> Result<T>,
    {
        let _lock = StoreLock::acquire(&self.path, &self.lock_options).await?;
        let mut store = self.load().await;
        let out = f(&mut store)?;
        store.normalize();
        self.save(&store).await?;
        Ok(out)
    }

    /// Insert a login result, or merge it into the record with the same
    /// normalized email. A bundle without any email matches on its upstream
    /// account id instead. Either way the record becomes active. Returns its
    /// index.
    pub async fn add_or_merge(&self, bundle: TokenBundle) -> Result<usize> {
        let bundle = bundle.with_id_token_claims();
        let email = bundle.email.as_deref().and_then(normalize_email);
        let account_id = bundle.account_id.clone();
        let now = now_millis();

        self.with_exclusive_lock(|store| {
            let existing = match (&email, &account_id) {
                (Some(email), _) => store.position_by_email(email),
                (None, Some(id)) => store.position_by_account_id(id),
                (None, None) => None,
            };
            let index = match existing {
                Some(index) => {
                    if let Some(account) = store.get_mut(index) {
                        account.apply_bundle(bundle);
                    }
                    info!(index, "merged credentials into existing account");
                    index
                }
                None => {
                    store.accounts.push(Account::from_bundle(bundle, now));
                    let index = store.len() - 1;
                    info!(index, "added new account");
                    index
                }
            };
            store.set_active(index);
            Ok(index)
        })
        .await
    }

    /// Apply `f` to the record at `index`. Returns the updated record, or
    /// `None` when the index is out of range.
    pub async fn update<F>(&self, index: usize, f: F) -> Result<Option<Account>>
    where
        F: FnOnce(&mut Account),
    {
        self.with_exclusive_lock(|store| {
            Ok(store.get_mut(index).map(|account| {
                f(account);
                account.clone()
            }))
        })
        .await
    }

    /// Apply `f` to the record matching `identity`, wherever it now lives.
    pub async fn update_by_identity<F>(
        &self,
        identity: &AccountIdentity,
        hint: Option<usize>,
        f: F,
    ) -> Result<Option<Account>>
    where
        F: FnOnce(&mut Account),
    {
        self.with_exclusive_lock(|store| {
            let Some(index) = store.locate(identity, hint) else {
                debug!(?identity, "account vanished before update");
                return Ok(None);
            };
            Ok(store.get_mut(index).map(|account| {
                f(account);
                account.clone()
            }))
        })
        .await
    }

    /// Delete the record at `index`. Removal is only ever an explicit
    /// operator action.
    pub async fn remove(&self, index: usize) -> Result<Option<Account>> {
        self.with_exclusive_lock(|store| {
            let removed = store.remove_at(index);
            if let Some(account) = &removed {
                info!(index, alias = account.alias(), "removed account");
            }
            Ok(removed)
        })
        .await
    }
}

/// Write the store atomically with owner-only permissions.
async fn write_atomic(path: &Path, store: &Store) -> Result<()> {
    let json = serde_json::to_string_pretty(store)
        .map_err(|e| Error::Serialize(format!("serializing store: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Io(format!("creating store directory: {e}")))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Io("store path has no file name".into()))?;
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    if let Err(e) = write_and_rename(&tmp_path, path, json.as_bytes()).await {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await
            && cleanup.kind() != ErrorKind::NotFound
        {
            warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temp store file");
        }
        return Err(e);
    }

    debug!(path = %path.display(), accounts = store.len(), "persisted store");
    Ok(())
}

/// Write `bytes` to a new owner-only file at `tmp_path`, then move it over
/// `path`.
async fn write_and_rename(tmp_path: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut open = tokio::fs::OpenOptions::new();
    open.write(true).create(true).truncate(true);
    #[cfg(unix)]
    open.mode(0o600);
    let mut file = open
        .open(tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp store file: {e}")))?;

    #[cfg(unix)]
    {
        // `mode` only applies on creation; a leftover temp file keeps its own
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    file.write_all(bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp store file: {e}")))?;
    drop(file);

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn bundle(email: Option<&str>, suffix: &str) -> TokenBundle {
        TokenBundle {
            access_token: format!("at_{suffix}"),
            refresh_token: format!("rt_{suffix}"),
            id_token: None,
            expires_at: 4_102_444_800_000,
            email: email.map(str::to_string),
            account_id: None,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> AccountStore {
        AccountStore::new(dir.path().join("accounts.json"))
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).load().await;
        assert!(store.is_empty());
        assert_eq!(store.active_index, -1);
    }

    #[tokio::test]
    async fn corrupt_file_self_heals_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store_in(&dir);
        std::fs::write(accounts.path(), "{ not json").unwrap();

        assert!(accounts.load().await.is_empty());

        // The next transaction overwrites the corrupt file with a valid one
        accounts.add_or_merge(bundle(Some("a@x.io"), "1")).await.unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(accounts.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
    }

    #[tokio::test]
    async fn add_or_merge_is_idempotent_by_email() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store_in(&dir);

        let first = accounts.add_or_merge(bundle(Some("a@x.io"), "1")).await.unwrap();
        accounts
            .update(first, |a| a.usage_count = 3)
            .await
            .unwrap();
        let second = accounts
            .add_or_merge(bundle(Some(" A@X.io "), "2"))
            .await
            .unwrap();

        assert_eq!(first, second);
        let store = accounts.load().await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.accounts[0].usage_count, 3);
        assert_eq!(store.accounts[0].access_token, "at_2");
        assert_eq!(store.active_index, 0);
    }

    #[tokio::test]
    async fn bundle_without_email_merges_by_account_id() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store_in(&dir);

        let mut first = bundle(None, "1");
        first.account_id = Some("acct-1".into());
        let index = accounts.add_or_merge(first).await.unwrap();
        accounts
            .update(index, |a| a.usage_count = 2)
            .await
            .unwrap();

        let mut second = bundle(None, "2");
        second.account_id = Some("acct-1".into());
        assert_eq!(accounts.add_or_merge(second).await.unwrap(), index);

        // An email always decides; a matching account id alone does not merge it
        let mut other = bundle(Some("b@x.io"), "3");
        other.account_id = Some("acct-1".into());
        assert_eq!(accounts.add_or_merge(other).await.unwrap(), 1);

        let store = accounts.load().await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.accounts[0].access_token, "at_2");
        assert_eq!(store.accounts[0].usage_count, 2);
    }

    #[tokio::test]
    async fn add_marks_new_account_active() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store_in(&dir);
        accounts.add_or_merge(bundle(Some("a@x.io"), "1")).await.unwrap();
        let index = accounts.add_or_merge(bundle(None, "2")).await.unwrap();

        let store = accounts.load().await;
        assert_eq!(index, 1);
        assert_eq!(store.active_index, 1);
        assert_eq!(store.accounts[1].alias(), "account-2");
    }

    #[tokio::test]
    async fn update_out_of_range_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store_in(&dir);
        let result = accounts.update(3, |a| a.usage_count = 1).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn remove_deletes_and_reindexes() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store_in(&dir);
        accounts.add_or_merge(bundle(Some("a@x.io"), "1")).await.unwrap();
        accounts.add_or_merge(bundle(Some("b@x.io"), "2")).await.unwrap();

        let removed = accounts.remove(0).await.unwrap().unwrap();
        assert_eq!(removed.email.as_deref(), Some("a@x.io"));

        let store = accounts.load().await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_index, 0);
        assert_eq!(store.accounts[0].alias(), "b");
    }

    #[tokio::test]
    async fn failed_transaction_writes_nothing_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store_in(&dir);
        accounts.add_or_merge(bundle(Some("a@x.io"), "1")).await.unwrap();

        let result: Result<()> = accounts
            .with_exclusive_lock(|store| {
                store.accounts.clear();
                Err(Error::Io("abort".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(accounts.load().await.len(), 1);
        let no_retry = LockOptions {
            retries: 0,
            ..LockOptions::default()
        };
        let _lock = crate::lock::StoreLock::acquire(accounts.path(), &no_retry)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn legacy_file_is_rewritten_in_current_schema() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store_in(&dir);
        std::fs::write(
            accounts.path(),
            r#"{"accounts":{"main":{"email":"m@x.io","accessToken":"a","refreshToken":"r","expiresAt":4102444800000}},"activeAlias":"main","rotationIndex":0}"#,
        )
        .unwrap();

        accounts.with_exclusive_lock(|_| Ok(())).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(accounts.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert!(raw["accounts"].is_array());
        assert_eq!(raw["accounts"][0]["alias"], "m");
        assert!(raw.get("activeAlias").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let accounts = store_in(&dir);
        accounts.add_or_merge(bundle(None, "1")).await.unwrap();

        let mode = std::fs::metadata(accounts.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "store file must be 0600, got {mode:o}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory where the store file should be
        let path = dir.path().join("accounts.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let accounts = AccountStore::new(path);
        let err = accounts.save(&Store::default()).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got: {err}");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn concurrent_transactions_do_not_lose_writes() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = Arc::new(AccountStore::with_lock_options(
            dir.path().join("accounts.json"),
            LockOptions {
                retries: 200,
                min_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(20),
            },
        ));

        let mut handles = vec![];
        for i in 0..10 {
            let accounts = accounts.clone();
            handles.push(tokio::spawn(async move {
                accounts
                    .add_or_merge(bundle(Some(&format!("user{i}@x.io")), &i.to_string()))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(accounts.load().await.len(), 10);
    }
}
