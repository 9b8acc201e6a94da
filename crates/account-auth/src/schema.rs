//! On-disk store schema and normalization
//!
//! Two shapes exist in the wild: the current positional schema
//! (`{version: 2, accounts: [...], activeIndex, rotationIndex, lastRotation}`)
//! and the legacy alias-keyed schema (`{accounts: {alias: record},
//! activeAlias, rotationIndex}`). Raw JSON is classified into one of the two
//! explicitly and converted to the canonical `Store`. Anything else becomes
//! an empty store. Legacy files are never written back.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::account::{Account, AccountIdentity, derive_alias, normalize_email};
use crate::constants::STORE_VERSION;

/// Canonical in-memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    pub version: u32,
    pub accounts: Vec<Account>,
    /// `-1` when there are no accounts.
    pub active_index: i64,
    /// Round-robin cursor over the available set; `-1` when empty.
    pub rotation_index: i64,
    /// Unix ms of the last committed selection.
    #[serde(default)]
    pub last_rotation: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            accounts: Vec::new(),
            active_index: -1,
            rotation_index: -1,
            last_rotation: 0,
        }
    }
}

impl Store {
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Account> {
        self.accounts.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Account> {
        self.accounts.get_mut(index)
    }

    pub fn active(&self) -> Option<&Account> {
        usize::try_from(self.active_index)
            .ok()
            .and_then(|i| self.accounts.get(i))
    }

    pub fn set_active(&mut self, index: usize) {
        if index < self.accounts.len() {
            self.active_index = index as i64;
        }
    }

    /// Index of the record matching `identity`, trying `hint` first.
    pub fn locate(&self, identity: &AccountIdentity, hint: Option<usize>) -> Option<usize> {
        if let Some(i) = hint
            && self.accounts.get(i).is_some_and(|a| identity.matches(a))
        {
            return Some(i);
        }
        self.accounts.iter().position(|a| identity.matches(a))
    }

    /// Position of the record whose normalized email equals `email`.
    pub fn position_by_email(&self, email: &str) -> Option<usize> {
        let email = normalize_email(email)?;
        self.accounts
            .iter()
            .position(|a| a.email.as_deref() == Some(email.as_str()))
    }

    /// Position of the record carrying upstream account id `account_id`.
    pub fn position_by_account_id(&self, account_id: &str) -> Option<usize> {
        self.accounts
            .iter()
            .position(|a| a.account_id.as_deref() == Some(account_id))
    }

    /// Remove the record at `index` and renormalize both cursors modulo the
    /// new length.
    pub fn remove_at(&mut self, index: usize) -> Option<Account> {
        if index >= self.accounts.len() {
            return None;
        }
        let removed = self.accounts.remove(index);
        let len = self.accounts.len() as i64;
        if len == 0 {
            self.active_index = -1;
            self.rotation_index = -1;
        } else {
            let mut active = self.active_index.max(0);
            if active > index as i64 {
                active -= 1;
            }
            self.active_index = active.rem_euclid(len);
            self.rotation_index = self.rotation_index.max(0).rem_euclid(len);
        }
        self.assign_aliases();
        Some(removed)
    }

    /// Restore every invariant: normalized unique emails, absolute
    /// millisecond expiries, derived aliases, clamped cursors.
    pub fn normalize(&mut self) {
        self.version = STORE_VERSION;
        for account in &mut self.accounts {
            account.email = account.email.as_deref().and_then(normalize_email);
            account.expires_at = to_epoch_millis(account.expires_at);
        }
        self.dedupe_by_email();
        self.assign_aliases();
        self.active_index = clamp_index(self.active_index, self.accounts.len());
        self.rotation_index = clamp_index(self.rotation_index, self.accounts.len());
    }

    /// Collapse records sharing an email, keeping the most recently used or
    /// added one in the slot of the first occurrence.
    fn dedupe_by_email(&mut self) {
        let original = self.accounts.len();
        let mut kept: Vec<Account> = Vec::with_capacity(original);
        let mut slot_by_email: HashMap<String, usize> = HashMap::new();
        let mut remap: Vec<usize> = Vec::with_capacity(original);

        for account in self.accounts.drain(..) {
            if let Some(email) = account.email.clone() {
                if let Some(&slot) = slot_by_email.get(&email) {
                    if account.recency() > kept[slot].recency() {
                        kept[slot] = account;
                    }
                    remap.push(slot);
                    continue;
                }
                slot_by_email.insert(email, kept.len());
            }
            remap.push(kept.len());
            kept.push(account);
        }

        if kept.len() != original {
            info!(
                before = original,
                after = kept.len(),
                "collapsed duplicate accounts by email"
            );
        }
        let remap_cursor = |cursor: i64| {
            usize::try_from(cursor)
                .ok()
                .and_then(|i| remap.get(i).copied())
                .map_or(cursor, |i| i as i64)
        };
        self.active_index = remap_cursor(self.active_index);
        self.rotation_index = remap_cursor(self.rotation_index);
        self.accounts = kept;
    }

    fn assign_aliases(&mut self) {
        let mut seen: HashSet<String> = HashSet::new();
        for (index, account) in self.accounts.iter_mut().enumerate() {
            let mut alias = derive_alias(account.email.as_deref(), index);
            if seen.contains(&alias) {
                alias = format!("{alias}-{}", index + 1);
            }
            seen.insert(alias.clone());
            account.set_alias(alias);
        }
    }
}

/// Clamp a cursor into `[0, len)`, or `-1` for an empty store.
fn clamp_index(index: i64, len: usize) -> i64 {
    if len == 0 {
        -1
    } else {
        index.clamp(0, len as i64 - 1)
    }
}

/// Expiries written as epoch seconds are lifted to milliseconds.
fn to_epoch_millis(value: u64) -> u64 {
    if value > 1_000_000_000 && value <= 1_000_000_000_000 {
        value * 1000
    } else {
        value
    }
}

/// Record shape of the legacy alias-keyed schema.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    #[serde(default)]
    email: Option<String>,
    #[serde(alias = "access")]
    access_token: String,
    #[serde(alias = "refresh")]
    refresh_token: String,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default, alias = "expires")]
    expires_at: u64,
    #[serde(default)]
    usage_count: u64,
    #[serde(default)]
    last_used: Option<u64>,
    #[serde(default)]
    added_at: u64,
    #[serde(default)]
    rate_limited_until: Option<u64>,
    #[serde(default)]
    auth_invalid: bool,
}

impl LegacyRecord {
    fn into_account(self) -> Account {
        let bundle = crate::token::TokenBundle {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            expires_at: self.expires_at,
            email: self.email,
            account_id: self.account_id,
        };
        let mut account = Account::from_bundle(bundle, self.added_at);
        account.usage_count = self.usage_count;
        account.last_used = self.last_used;
        account.rate_limited_until = self.rate_limited_until;
        account.auth_invalid = self.auth_invalid;
        account
    }
}

/// Raw store JSON, classified by shape.
#[derive(Debug)]
pub enum StoreShape {
    Current {
        accounts: Vec<Value>,
        active_index: i64,
        rotation_index: i64,
        last_rotation: u64,
    },
    Legacy {
        accounts: Map<String, Value>,
        active_alias: Option<String>,
        rotation_index: i64,
    },
    Unrecognized,
}

impl StoreShape {
    /// Decide which schema a parsed document follows.
    ///
    /// Current: `version >= 2` with an `accounts` array. Legacy: `version`
    /// absent or `1` with an `accounts` object.
    pub fn classify(value: Value) -> Self {
        let Value::Object(mut root) = value else {
            return Self::Unrecognized;
        };
        let version = root.get("version").and_then(Value::as_u64);
        let int = |root: &Map<String, Value>, key: &str| {
            root.get(key).and_then(Value::as_i64).unwrap_or(0)
        };

        match (version, root.remove("accounts")) {
            (Some(v), Some(Value::Array(accounts))) if v >= u64::from(STORE_VERSION) => {
                Self::Current {
                    active_index: int(&root, "activeIndex"),
                    rotation_index: int(&root, "rotationIndex"),
                    last_rotation: root
                        .get("lastRotation")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    accounts,
                }
            }
            (None | Some(1), Some(Value::Object(accounts))) => Self::Legacy {
                active_alias: root
                    .get("activeAlias")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                rotation_index: int(&root, "rotationIndex"),
                accounts,
            },
            _ => Self::Unrecognized,
        }
    }

    /// Convert to a normalized canonical store. Records that fail to decode
    /// are dropped with a warning rather than discarding the whole file.
    pub fn into_store(self) -> Store {
        let mut store = match self {
            Self::Current {
                accounts,
                active_index,
                rotation_index,
                last_rotation,
            } => Store {
                version: STORE_VERSION,
                accounts: accounts
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, raw)| match serde_json::from_value::<Account>(raw) {
                        Ok(account) => Some(account),
                        Err(e) => {
                            warn!(index = i, error = %e, "dropping unreadable account record");
                            None
                        }
                    })
                    .collect(),
                active_index,
                rotation_index,
                last_rotation,
            },
            Self::Legacy {
                accounts,
                active_alias,
                rotation_index,
            } => migrate_legacy(accounts, active_alias, rotation_index),
            Self::Unrecognized => Store::default(),
        };
        store.normalize();
        store
    }
}

fn migrate_legacy(
    accounts: Map<String, Value>,
    active_alias: Option<String>,
    rotation_index: i64,
) -> Store {
    let mut records: Vec<(String, Account)> = accounts
        .into_iter()
        .filter_map(|(alias, raw)| match serde_json::from_value::<LegacyRecord>(raw) {
            Ok(record) => Some((alias, record.into_account())),
            Err(e) => {
                warn!(alias, error = %e, "dropping unreadable legacy account record");
                None
            }
        })
        .collect();
    records.sort_by(|(a_alias, a), (b_alias, b)| {
        a.added_at.cmp(&b.added_at).then_with(|| a_alias.cmp(b_alias))
    });

    let active_index = active_alias
        .and_then(|alias| records.iter().position(|(a, _)| *a == alias))
        .map_or(0, |i| i as i64);

    info!(accounts = records.len(), "migrated legacy alias-keyed store");
    Store {
        version: STORE_VERSION,
        accounts: records.into_iter().map(|(_, account)| account).collect(),
        active_index,
        rotation_index,
        last_rotation: 0,
    }
}
