//! Cross-process advisory lock for the account store
//!
//! The lock is an OS advisory lock (`flock` on Unix, `LockFileEx` on
//! Windows) taken on a sibling file, `<store>.lock`. The store file itself is
//! never locked because it is replaced by rename on every write. The kernel
//! drops the lock when the holding process exits, so a crashed holder never
//! blocks the store and the lock file is never deleted.
//!
//! Contenders retry `try_lock_exclusive` with capped exponential backoff and
//! give up with `Error::LockTimeout` once the retry budget is spent. The
//! holder's pid and acquisition time are written into the lock file for
//! diagnostics only.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::account::now_millis;
use crate::error::{Error, Result};

/// Retry tuning for `StoreLock::acquire`.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Attempts after the first before giving up.
    pub retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retries: 10,
            min_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    acquired_at: u64,
}

/// Held store lock. Released when dropped.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    file: File,
}

impl StoreLock {
    /// Acquire the lock guarding `target`.
    pub async fn acquire(target: &Path, options: &LockOptions) -> Result<Self> {
        let path = lock_path_for(target);
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Io(format!("creating store directory: {e}")))?;
        }

        let mut open = tokio::fs::OpenOptions::new();
        open.create(true).read(true).write(true).truncate(false);
        #[cfg(unix)]
        open.mode(0o600);
        let file = open
            .open(&path)
            .await
            .map_err(|e| Error::Io(format!("opening lock file: {e}")))?
            .into_std()
            .await;

        let started = Instant::now();
        let mut backoff = options.min_backoff;
        for attempt in 0..=options.retries {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %path.display(), attempt, "acquired store lock");
                    record_owner(&file, &path);
                    return Ok(Self { path, file });
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(Error::Io(format!("locking {}: {e}", path.display()))),
            }

            if attempt < options.retries {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(options.max_backoff);
            }
        }

        Err(Error::LockTimeout {
            path: path.display().to_string(),
            waited: started.elapsed(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        match FileExt::unlock(&self.file) {
            Ok(()) => debug!(path = %self.path.display(), "released store lock"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release store lock"),
        }
    }
}

/// `<store>.lock` beside the store file.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn record_owner(file: &File, path: &Path) {
    let owner = LockOwner {
        pid: std::process::id(),
        acquired_at: now_millis(),
    };
    let mut handle = file;
    let written = serde_json::to_vec(&owner)
        .map_err(std::io::Error::other)
        .and_then(|body| {
            handle.set_len(0)?;
            handle.seek(SeekFrom::Start(0))?;
            handle.write_all(&body)
        });
    if let Err(e) = written {
        debug!(path = %path.display(), error = %e, "could not record lock owner");
    }
}
