//! Account selection and post-request bookkeeping
//!
//! `RotationEngine::select` picks one account per call:
//! 1. Load a snapshot and compute the available set (no future cooldown,
//!    `auth_invalid` clear)
//! 2. Order the available set by strategy into a candidate list
//! 3. Walk candidates through `TokenLifecycleManager::ensure_valid_within`,
//!    stopping at the first that yields a token
//! 4. Commit inside a store transaction that re-reads the file, so tokens
//!    refreshed during step 3 (here or in another process) are never
//!    overwritten; only usage stamps and cursors are written
//!
//! When nothing is available the engine says so. It never force-selects an
//! account it knows to be bad.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use account_auth::{
    Account, AccountStore, EXPIRY_SAFETY_BUFFER_MS, RateLimits, Store, now_millis,
};
use common::Secret;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lifecycle::TokenLifecycleManager;
use crate::quota::{
    MODEL_UNSUPPORTED_COOLDOWN, ResponseClass, WORKSPACE_DEACTIVATED_COOLDOWN, classify_status,
};
use crate::ratelimit;

/// Candidate ordering policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    /// Ascending usage count, ties broken by oldest `last_used`.
    LeastUsed,
    Random,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastUsed => "least-used",
            Strategy::Random => "random",
        }
    }
}

impl FromStr for Strategy {
    type Err = common::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "least-used" | "least_used" | "leastused" => Ok(Strategy::LeastUsed),
            "random" => Ok(Strategy::Random),
            other => Err(common::Error::Config(format!(
                "unknown rotation strategy '{other}' (expected round-robin, least-used or random)"
            ))),
        }
    }
}

/// Selection settings, read from the `[rotation]` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    #[serde(default)]
    pub strategy: Strategy,

    /// Cooldown applied to a 429 that carries no usable reset hint.
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
}

fn default_rate_limit_cooldown_secs() -> u64 {
    60
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
        }
    }
}

impl RotationConfig {
    pub fn with_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}

/// An account chosen for a request, with a token valid for at least the
/// refresh safety buffer.
#[derive(Debug)]
pub struct SelectedAccount {
    /// Position in the store at commit time.
    pub index: usize,
    /// The record as committed, usage stamps included.
    pub account: Account,
    pub token: Secret<String>,
}

/// Outcome of one selection.
#[derive(Debug)]
pub enum Selection {
    Selected(SelectedAccount),
    /// The store holds no accounts at all.
    NoAccounts,
    /// Accounts exist but none could serve: all cooling down, invalid, or
    /// failing to refresh.
    Exhausted { total: usize, available: usize },
}

impl Selection {
    pub fn into_selected(self) -> Option<SelectedAccount> {
        match self {
            Selection::Selected(selected) => Some(selected),
            Selection::NoAccounts | Selection::Exhausted { .. } => None,
        }
    }
}

/// Runtime state of one account in the pool summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccountState {
    Available,
    CoolingDown { cooldown_remaining_secs: u64 },
    Disabled,
}

impl AccountState {
    fn of(account: &Account, now: u64) -> Self {
        if account.auth_invalid {
            return AccountState::Disabled;
        }
        match account.cooldown_until() {
            Some(until) if until > now => AccountState::CoolingDown {
                cooldown_remaining_secs: (until - now).div_ceil(1000),
            },
            _ => AccountState::Available,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AccountState::Available => "available",
            AccountState::CoolingDown { .. } => "cooling_down",
            AccountState::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub active: bool,
    pub usage_count: u64,
    #[serde(flatten)]
    pub state: AccountState,
}

/// Overall health: every account available, some, or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub status: PoolHealth,
    pub accounts_total: usize,
    pub accounts_available: usize,
    pub accounts_cooling_down: usize,
    pub accounts_disabled: usize,
    pub accounts: Vec<AccountSummary>,
}

/// Chooses accounts and records what happened to them.
pub struct RotationEngine {
    store: Arc<AccountStore>,
    lifecycle: Arc<TokenLifecycleManager>,
}

impl RotationEngine {
    pub fn new(lifecycle: Arc<TokenLifecycleManager>) -> Self {
        Self {
            store: lifecycle.store().clone(),
            lifecycle,
        }
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<TokenLifecycleManager> {
        &self.lifecycle
    }

    /// Account and token for the next request, or `None` when nothing can
    /// serve. Only store failures (lock timeout, write errors) are `Err`.
    pub async fn get_next_account(&self, config: &RotationConfig) -> Result<Option<SelectedAccount>> {
        Ok(self.select(config).await?.into_selected())
    }

    /// Select and commit one account.
    pub async fn select(&self, config: &RotationConfig) -> Result<Selection> {
        let snapshot = self.store.load().await;
        let now = now_millis();

        if snapshot.is_empty() {
            debug!("no accounts configured");
            return Ok(Selection::NoAccounts);
        }

        let available: Vec<usize> = snapshot
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_available(now))
            .map(|(i, _)| i)
            .collect();

        if available.is_empty() {
            metrics::counter!("rotation_exhausted_total").increment(1);
            warn!(total = snapshot.len(), "no available accounts");
            return Ok(Selection::Exhausted {
                total: snapshot.len(),
                available: 0,
            });
        }

        for position in order_candidates(&snapshot, &available, config.strategy) {
            let index = available[position];
            let Some(account) = snapshot.get(index) else {
                continue;
            };

            let token = match self
                .lifecycle
                .ensure_valid_within(account, Some(index), EXPIRY_SAFETY_BUFFER_MS)
                .await
            {
                Ok(token) => token,
                Err(e) if e.is_candidate_failure() => {
                    warn!(account = account.alias(), error = %e, "candidate failed, trying next");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let cursor = ((position + 1) % available.len()) as i64;
            match self.commit(account, index, cursor).await? {
                Some((index, account)) => {
                    metrics::counter!("rotation_selections_total", "strategy" => config.strategy.label())
                        .increment(1);
                    info!(
                        account = account.alias(),
                        index,
                        strategy = config.strategy.label(),
                        usage_count = account.usage_count,
                        "account selected"
                    );
                    return Ok(Selection::Selected(SelectedAccount {
                        index,
                        account,
                        token,
                    }));
                }
                None => {
                    warn!(account = account.alias(), "account removed during selection, trying next");
                }
            }
        }

        metrics::counter!("rotation_exhausted_total").increment(1);
        warn!(
            total = snapshot.len(),
            available = available.len(),
            "every available account failed token validation"
        );
        Ok(Selection::Exhausted {
            total: snapshot.len(),
            available: available.len(),
        })
    }

    /// Stamp usage on the chosen account in a freshly loaded snapshot.
    async fn commit(
        &self,
        chosen: &Account,
        hint: usize,
        cursor: i64,
    ) -> Result<Option<(usize, Account)>> {
        let identity = chosen.identity();
        let committed = self
            .store
            .with_exclusive_lock(|store| {
                let Some(index) = store.locate(&identity, Some(hint)) else {
                    return Ok(None);
                };
                let now = now_millis();
                let Some(account) = store.get_mut(index) else {
                    return Ok(None);
                };
                account.usage_count += 1;
                account.last_used = Some(now);
                account.last_seen_at = Some(now);
                let account = account.clone();
                store.set_active(index);
                store.rotation_index = cursor;
                store.last_rotation = now;
                Ok(Some((index, account)))
            })
            .await?;
        Ok(committed)
    }

    async fn mutate<F>(&self, account: &Account, f: F) -> Result<Option<Account>>
    where
        F: FnOnce(&mut Account),
    {
        Ok(self
            .store
            .update_by_identity(&account.identity(), None, f)
            .await?)
    }

    /// Exclude `account` from selection for `cooldown`.
    pub async fn mark_rate_limited(&self, account: &Account, cooldown: Duration) -> Result<()> {
        let until = now_millis().saturating_add(cooldown.as_millis() as u64);
        info!(account = account.alias(), cooldown_ms = cooldown.as_millis() as u64, "account rate limited");
        self.mutate(account, |a| a.rate_limited_until = Some(until))
            .await?;
        Ok(())
    }

    /// Set the sticky invalid flag; cleared by a fresh login or refresh.
    pub async fn mark_auth_invalid(&self, account: &Account) -> Result<()> {
        warn!(account = account.alias(), "account marked auth-invalid");
        self.mutate(account, |a| a.auth_invalid = true).await?;
        Ok(())
    }

    pub async fn clear_auth_invalid(&self, account: &Account) -> Result<()> {
        info!(account = account.alias(), "auth-invalid flag cleared");
        self.mutate(account, |a| a.auth_invalid = false).await?;
        Ok(())
    }

    pub async fn mark_model_unsupported(&self, account: &Account, cooldown: Duration) -> Result<()> {
        let until = now_millis().saturating_add(cooldown.as_millis() as u64);
        info!(account = account.alias(), "model unsupported for account");
        self.mutate(account, |a| a.model_unsupported_until = Some(until))
            .await?;
        Ok(())
    }

    pub async fn mark_workspace_deactivated(
        &self,
        account: &Account,
        cooldown: Duration,
    ) -> Result<()> {
        let until = now_millis().saturating_add(cooldown.as_millis() as u64);
        warn!(account = account.alias(), "workspace deactivated for account");
        self.mutate(account, |a| a.workspace_deactivated_until = Some(until))
            .await?;
        Ok(())
    }

    /// Merge observed windows into the stored record.
    pub async fn record_rate_limits(&self, account: &Account, update: &RateLimits) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.mutate(account, |a| {
            a.rate_limits = ratelimit::merge(&a.rate_limits, update);
        })
        .await?;
        Ok(())
    }

    /// Post-request bookkeeping for one upstream response: merge any
    /// rate-limit headers and apply the state transition its status implies,
    /// all in one store transaction.
    pub async fn report_response(
        &self,
        account: &Account,
        status: u16,
        headers: &HeaderMap,
        body: &str,
        config: &RotationConfig,
    ) -> Result<ResponseClass> {
        let now = now_millis();
        let class = classify_status(status, body);
        let limits = ratelimit::extract_from_headers_at(headers, now);

        if matches!(class, ResponseClass::Ok | ResponseClass::Transient) && limits.is_none() {
            debug!(account = account.alias(), status, "no state change for response");
            return Ok(class);
        }

        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| ratelimit::parse_reset(v, now));
        let fallback = now.saturating_add(config.rate_limit_cooldown().as_millis() as u64);

        self.mutate(account, |a| {
            if let Some(update) = &limits {
                a.rate_limits = ratelimit::merge(&a.rate_limits, update);
            }
            match class {
                ResponseClass::RateLimited => {
                    let until = retry_after
                        .or_else(|| exhausted_reset(&a.rate_limits, now))
                        .unwrap_or(fallback);
                    a.rate_limited_until = Some(until);
                }
                ResponseClass::AuthInvalid => a.auth_invalid = true,
                ResponseClass::ModelUnsupported => {
                    a.model_unsupported_until =
                        Some(now.saturating_add(MODEL_UNSUPPORTED_COOLDOWN.as_millis() as u64));
                }
                ResponseClass::WorkspaceDeactivated => {
                    a.workspace_deactivated_until =
                        Some(now.saturating_add(WORKSPACE_DEACTIVATED_COOLDOWN.as_millis() as u64));
                }
                ResponseClass::Ok | ResponseClass::Transient => {}
            }
        })
        .await?;

        if class != ResponseClass::Ok {
            info!(account = account.alias(), status, class = class.label(), "upstream response recorded");
        }
        Ok(class)
    }

    /// Per-account state and overall pool health.
    pub async fn status(&self) -> PoolStatus {
        let snapshot = self.store.load().await;
        let now = now_millis();
        let active = snapshot.active_index;

        let accounts: Vec<AccountSummary> = snapshot
            .accounts
            .iter()
            .enumerate()
            .map(|(i, a)| AccountSummary {
                alias: a.alias().to_string(),
                email: a.email.clone(),
                active: i as i64 == active,
                usage_count: a.usage_count,
                state: AccountState::of(a, now),
            })
            .collect();

        let count = |label: &str| accounts.iter().filter(|a| a.state.label() == label).count();
        let available = count("available");
        let cooling_down = count("cooling_down");
        let disabled = count("disabled");
        let total = accounts.len();
        let status = if total > 0 && available == total {
            PoolHealth::Healthy
        } else if available > 0 {
            PoolHealth::Degraded
        } else {
            PoolHealth::Unhealthy
        };

        PoolStatus {
            status,
            accounts_total: total,
            accounts_available: available,
            accounts_cooling_down: cooling_down,
            accounts_disabled: disabled,
            accounts,
        }
    }
}

/// Positions into `available`, in the order candidates should be tried.
fn order_candidates(store: &Store, available: &[usize], strategy: Strategy) -> Vec<usize> {
    let n = available.len();
    let mut positions: Vec<usize> = (0..n).collect();
    match strategy {
        Strategy::RoundRobin => {
            let start = usize::try_from(store.rotation_index).unwrap_or(0) % n;
            positions.rotate_left(start);
        }
        Strategy::LeastUsed => {
            positions.sort_by_key(|&p| {
                let a = &store.accounts[available[p]];
                (a.usage_count, a.last_used.unwrap_or(0))
            });
        }
        Strategy::Random => positions.shuffle(&mut rand::rng()),
    }
    positions
}

/// Latest future reset among windows that report no remaining capacity.
fn exhausted_reset(limits: &RateLimits, now: u64) -> Option<u64> {
    [limits.five_hour.as_ref(), limits.weekly.as_ref()]
        .into_iter()
        .flatten()
        .filter(|w| w.is_exhausted())
        .filter_map(|w| w.reset_at)
        .filter(|&reset| reset > now)
        .max()
}
