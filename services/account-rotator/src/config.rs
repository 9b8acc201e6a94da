//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. Every field has a
//! default, so an absent default-path config file runs with defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use account_auth::{DEFAULT_CLIENT_ID, DEFAULT_TOKEN_ENDPOINT, LockOptions};
use account_pool::{RotationConfig, Strategy};
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "account-rotator.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Account store location and lock tuning
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_min_backoff_ms")]
    pub lock_min_backoff_ms: u64,
    #[serde(default = "default_lock_max_backoff_ms")]
    pub lock_max_backoff_ms: u64,
}

/// Token endpoint used for refresh-token exchanges
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Background refresh cadence
#[derive(Debug, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub threshold_secs: u64,
}

/// Externally maintained credential file to import from
#[derive(Debug, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub auth_file: Option<PathBuf>,
    #[serde(default = "default_sync_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus scrape listener; disabled when unset.
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

fn default_store_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home)
            .join(".account-rotator")
            .join("accounts.json"),
        None => PathBuf::from("accounts.json"),
    }
}

fn default_lock_retries() -> u32 {
    10
}

fn default_lock_min_backoff_ms() -> u64 {
    25
}

fn default_lock_max_backoff_ms() -> u64 {
    1000
}

fn default_token_endpoint() -> String {
    DEFAULT_TOKEN_ENDPOINT.to_string()
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_threshold() -> u64 {
    900
}

fn default_sync_ttl() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_retries: default_lock_retries(),
            lock_min_backoff_ms: default_lock_min_backoff_ms(),
            lock_max_backoff_ms: default_lock_max_backoff_ms(),
        }
    }
}

impl StoreConfig {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            retries: self.lock_retries,
            min_backoff: Duration::from_millis(self.lock_min_backoff_ms),
            max_backoff: Duration::from_millis(self.lock_max_backoff_ms),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_endpoint: default_token_endpoint(),
            client_id: default_client_id(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval(),
            threshold_secs: default_refresh_threshold(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auth_file: None,
            ttl_secs: default_sync_ttl(),
            interval_secs: default_sync_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Like `load`, but a missing file yields the defaults. Used for the
    /// implicit default path only; an explicitly named file must exist.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Config::default().finish()
        }
    }

    fn finish(mut self) -> common::Result<Self> {
        self.apply_env()?;
        self.validate()?;
        Ok(self)
    }

    /// `ROTATOR_STORE_PATH` overrides `store.path`; `ROTATOR_STRATEGY`
    /// overrides `rotation.strategy`.
    fn apply_env(&mut self) -> common::Result<()> {
        if let Some(path) = std::env::var_os("ROTATOR_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Ok(strategy) = std::env::var("ROTATOR_STRATEGY") {
            self.rotation.strategy = strategy.parse::<Strategy>()?;
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if !self.oauth.token_endpoint.starts_with("http://")
            && !self.oauth.token_endpoint.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "token_endpoint must start with http:// or https://, got: {}",
                self.oauth.token_endpoint
            )));
        }
        if self.oauth.timeout_secs == 0 {
            return Err(common::Error::Config(
                "oauth.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.refresh.interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh.interval_secs must be greater than 0".into(),
            ));
        }
        if self.sync.interval_secs == 0 {
            return Err(common::Error::Config(
                "sync.interval_secs must be greater than 0".into(),
            ));
        }
        if self.store.lock_min_backoff_ms > self.store.lock_max_backoff_ms {
            return Err(common::Error::Config(
                "store.lock_min_backoff_ms must not exceed lock_max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var. The
    /// flag records whether the path was named explicitly.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_FILE), false)
    }
}
