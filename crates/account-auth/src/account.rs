//! Account records and their rate-limit windows
//!
//! An `Account` is one OAuth credential set plus the usage and status
//! metadata the rotation engine needs. Every timestamp is an absolute unix
//! time in milliseconds; relative values are converted before they reach
//! this type.

use serde::{Deserialize, Serialize};

use crate::constants::EXPIRY_SAFETY_BUFFER_MS;
use crate::token::TokenBundle;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Trim and lower-case an email. Blank input normalizes to `None`.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() { None } else { Some(email) }
}

/// Label for the account at `index`: the email local-part when known,
/// otherwise a 1-based positional name.
pub fn derive_alias(email: Option<&str>, index: usize) -> String {
    email
        .and_then(|e| e.split('@').next())
        .filter(|local| !local.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("account-{}", index + 1))
}

/// One upstream capacity budget.
///
/// Fields are optional so a partial observation (for example a header that
/// only reports `remaining`) can be merged without clobbering the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

impl RateLimitWindow {
    /// True when no field carries a value.
    pub fn is_blank(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_at.is_none()
            && self.updated_at.is_none()
    }

    /// Whether the window reports no capacity left.
    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_some_and(|r| r <= 0.0)
    }
}

/// The short (five-hour) and long (weekly) windows tracked per account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub five_hour: Option<RateLimitWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<RateLimitWindow>,
}

impl RateLimits {
    pub fn is_empty(&self) -> bool {
        self.five_hour.is_none() && self.weekly.is_none()
    }
}

/// Bookkeeping for the active capacity probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Success,
    Error,
    Stopped,
}

/// A stored OAuth account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Derived from email or position on every normalization pass.
    #[serde(default)]
    alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Absolute expiry, unix milliseconds.
    #[serde(default)]
    pub expires_at: u64,

    #[serde(default)]
    pub auth_invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_unsupported_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_deactivated_until: Option<u64>,

    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<u64>,
    #[serde(default)]
    pub added_at: u64,

    #[serde(flatten)]
    pub rate_limits: RateLimits,

    #[serde(default)]
    pub limit_status: LimitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_error: Option<String>,
}

impl Account {
    /// Build a fresh record from a token bundle. The alias is filled in when
    /// the record is placed into a store.
    pub fn from_bundle(bundle: TokenBundle, now: u64) -> Self {
        let email = bundle.email.as_deref().and_then(normalize_email);
        Self {
            alias: String::new(),
            email,
            access_token: bundle.access_token,
            refresh_token: bundle.refresh_token,
            id_token: bundle.id_token,
            account_id: bundle.account_id,
            expires_at: bundle.expires_at,
            auth_invalid: false,
            rate_limited_until: None,
            model_unsupported_until: None,
            workspace_deactivated_until: None,
            usage_count: 0,
            last_used: None,
            last_seen_at: None,
            added_at: now,
            rate_limits: RateLimits::default(),
            limit_status: LimitStatus::Idle,
            limit_error: None,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub(crate) fn set_alias(&mut self, alias: String) {
        self.alias = alias;
    }

    /// Overwrite credential material from a newer bundle.
    ///
    /// An email already on record is kept, since it is the de-duplication
    /// key. Usage statistics and rate-limit windows are left alone. A successful
    /// login or refresh clears the sticky `auth_invalid` flag.
    pub fn apply_bundle(&mut self, bundle: TokenBundle) {
        self.access_token = bundle.access_token;
        self.refresh_token = bundle.refresh_token;
        self.expires_at = bundle.expires_at;
        if bundle.id_token.is_some() {
            self.id_token = bundle.id_token;
        }
        if bundle.account_id.is_some() {
            self.account_id = bundle.account_id;
        }
        if self.email.is_none() {
            self.email = bundle.email.as_deref().and_then(normalize_email);
        }
        self.auth_invalid = false;
    }

    /// Latest of the three cooldown timestamps, if any is set.
    pub fn cooldown_until(&self) -> Option<u64> {
        [
            self.rate_limited_until,
            self.model_unsupported_until,
            self.workspace_deactivated_until,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// No cooldown in the future and not flagged as invalid.
    pub fn is_available(&self, now: u64) -> bool {
        !self.auth_invalid && self.cooldown_until().is_none_or(|until| until <= now)
    }

    /// Whether the access token is inside the refresh safety buffer.
    pub fn needs_refresh(&self, now: u64) -> bool {
        self.expires_at <= now.saturating_add(EXPIRY_SAFETY_BUFFER_MS)
    }

    /// Timestamp used to pick a survivor when two records share an email.
    pub fn recency(&self) -> u64 {
        self.last_used.unwrap_or(0).max(self.added_at)
    }

    pub fn identity(&self) -> AccountIdentity {
        AccountIdentity {
            email: self.email.clone(),
            account_id: self.account_id.clone(),
            added_at: self.added_at,
        }
    }
}

/// Stable handle for finding an account again after the store was re-read.
///
/// Positions can shift under concurrent removal and tokens change on every
/// refresh, so records are matched by email, then upstream account id, then
/// creation time. A refresh may fill in an email that was unknown when the
/// identity was taken, so the weaker keys ignore the record's email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub email: Option<String>,
    pub account_id: Option<String>,
    pub added_at: u64,
}

impl AccountIdentity {
    pub fn matches(&self, account: &Account) -> bool {
        match (&self.email, &self.account_id) {
            (Some(email), _) => account.email.as_deref() == Some(email.as_str()),
            (None, Some(id)) => account.account_id.as_deref() == Some(id.as_str()),
            (None, None) => account.added_at == self.added_at,
        }
    }
}
