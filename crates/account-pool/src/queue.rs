//! Sequential capacity probe sweep
//!
//! The passive tracker only learns about accounts that carry live traffic.
//! `RefreshQueue` walks every stored account in order and asks a `Prober`
//! for its real remaining capacity, merging the answer into the store.
//!
//! One sweep at a time: starting while a sweep runs returns the in-flight
//! progress unchanged. Stopping is advisory and only observed between
//! targets; a probe already in flight always finishes. Targets not yet
//! started when the stop lands are recorded as `Stopped`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use account_auth::{Account, AccountIdentity, AccountStore, LimitStatus, RateLimits};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ratelimit;

/// Recorded for targets skipped by a stop request.
pub const STOPPED_RESULT: &str = "Stopped";

/// Boxed probe future, so `Prober` stays usable as `Arc<dyn Prober>`.
pub type ProbeFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<RateLimits, String>> + Send + 'a>>;

/// Measures one account's remaining capacity, typically by issuing an
/// isolated live exchange and reading the session log it produces.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, account: &'a Account) -> ProbeFuture<'a>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    #[default]
    Idle,
    Running,
    Completed,
    Stopped,
}

/// Outcome for one target of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub alias: String,
    pub status: LimitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared progress of the current or last sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueProgress {
    pub state: QueueState,
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub current_account: Option<String>,
    pub results: Vec<ProbeResult>,
}

impl QueueProgress {
    pub fn is_running(&self) -> bool {
        self.state == QueueState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state == QueueState::Stopped
    }
}

struct Target {
    identity: AccountIdentity,
    index: usize,
    alias: String,
}

pub struct RefreshQueue {
    store: Arc<AccountStore>,
    prober: Arc<dyn Prober>,
    progress: RwLock<QueueProgress>,
    stop_requested: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshQueue {
    pub fn new(store: Arc<AccountStore>, prober: Arc<dyn Prober>) -> Self {
        Self {
            store,
            prober,
            progress: RwLock::new(QueueProgress::default()),
            stop_requested: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub async fn progress(&self) -> QueueProgress {
        self.progress.read().await.clone()
    }

    /// Begin a sweep over every stored account. If one is already running,
    /// its progress is returned and nothing else happens.
    pub async fn start(self: &Arc<Self>) -> crate::Result<QueueProgress> {
        let mut task = self.task.lock().await;
        {
            let progress = self.progress.read().await;
            if progress.is_running() {
                debug!(completed = progress.completed, total = progress.total, "probe sweep already running");
                return Ok(progress.clone());
            }
        }

        let targets: Vec<Target> = self
            .store
            .with_exclusive_lock(|store| {
                Ok(store
                    .accounts
                    .iter_mut()
                    .enumerate()
                    .map(|(index, account)| {
                        account.limit_status = LimitStatus::Queued;
                        account.limit_error = None;
                        Target {
                            identity: account.identity(),
                            index,
                            alias: account.alias().to_string(),
                        }
                    })
                    .collect())
            })
            .await?;

        self.stop_requested.store(false, Ordering::SeqCst);
        let snapshot = {
            let mut progress = self.progress.write().await;
            *progress = QueueProgress {
                state: QueueState::Running,
                total: targets.len(),
                ..QueueProgress::default()
            };
            progress.clone()
        };
        info!(total = targets.len(), "probe sweep started");

        let queue = Arc::clone(self);
        *task = Some(tokio::spawn(async move { queue.run(targets).await }));
        Ok(snapshot)
    }

    /// Ask the running sweep to stop after its current target. Returns
    /// whether a sweep was running.
    pub async fn request_stop(&self) -> bool {
        if !self.progress.read().await.is_running() {
            return false;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        info!("probe sweep stop requested");
        true
    }

    /// Wait for the current sweep, if any, and return the final progress.
    pub async fn wait(&self) -> QueueProgress {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "probe sweep task failed");
        }
        self.progress().await
    }

    async fn run(&self, targets: Vec<Target>) {
        let mut stopped = false;

        for target in &targets {
            if !stopped && self.stop_requested.load(Ordering::SeqCst) {
                stopped = true;
            }
            if stopped {
                self.set_status(target, LimitStatus::Stopped, Some(STOPPED_RESULT.into()), None)
                    .await;
                self.progress.write().await.results.push(ProbeResult {
                    alias: target.alias.clone(),
                    status: LimitStatus::Stopped,
                    error: Some(STOPPED_RESULT.into()),
                });
                continue;
            }

            self.progress.write().await.current_account = Some(target.alias.clone());
            let result = self.probe_one(target).await;

            let mut progress = self.progress.write().await;
            progress.completed += 1;
            if result.status == LimitStatus::Error {
                progress.errors += 1;
            }
            progress.results.push(result);
        }

        let mut progress = self.progress.write().await;
        progress.current_account = None;
        progress.state = if stopped {
            QueueState::Stopped
        } else {
            QueueState::Completed
        };
        info!(
            completed = progress.completed,
            errors = progress.errors,
            total = progress.total,
            stopped,
            "probe sweep finished"
        );
    }

    async fn probe_one(&self, target: &Target) -> ProbeResult {
        let Some(account) = self.set_status(target, LimitStatus::Running, None, None).await else {
            warn!(account = %target.alias, "probe target vanished from store");
            return ProbeResult {
                alias: target.alias.clone(),
                status: LimitStatus::Error,
                error: Some("account no longer in store".into()),
            };
        };

        debug!(account = %target.alias, "probing account capacity");
        let (status, error, limits) = match self.prober.probe(&account).await {
            Ok(limits) => (LimitStatus::Success, None, Some(limits)),
            Err(reason) => {
                warn!(account = %target.alias, error = %reason, "capacity probe failed");
                (LimitStatus::Error, Some(reason), None)
            }
        };
        let label = if status == LimitStatus::Success { "success" } else { "error" };
        metrics::counter!("probe_results_total", "result" => label).increment(1);

        self.set_status(target, status, error.clone(), limits.as_ref())
            .await;
        ProbeResult {
            alias: target.alias.clone(),
            status,
            error,
        }
    }

    /// Persist probe bookkeeping for `target`, merging `limits` when given.
    /// Store failures are logged, not propagated; the sweep keeps going.
    async fn set_status(
        &self,
        target: &Target,
        status: LimitStatus,
        error: Option<String>,
        limits: Option<&RateLimits>,
    ) -> Option<Account> {
        let outcome = self
            .store
            .update_by_identity(&target.identity, Some(target.index), |a| {
                a.limit_status = status;
                a.limit_error = error;
                if let Some(update) = limits {
                    a.rate_limits = ratelimit::merge(&a.rate_limits, update);
                }
            })
            .await;
        match outcome {
            Ok(account) => account,
            Err(e) => {
                warn!(account = %target.alias, error = %e, "failed to record probe status");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FUTURE_EXPIRY, account, seed};
    use account_auth::RateLimitWindow;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn limits(remaining: f64) -> RateLimits {
        RateLimits {
            five_hour: Some(RateLimitWindow {
                limit: Some(100.0),
                remaining: Some(remaining),
                reset_at: None,
                updated_at: Some(1),
            }),
            weekly: None,
        }
    }

    /// Answers from a per-alias script; the first probe blocks until released.
    struct GatedProber {
        entered: Notify,
        release: Notify,
        gate_first: bool,
        calls: AtomicUsize,
        script: HashMap<String, std::result::Result<RateLimits, String>>,
    }

    impl GatedProber {
        fn new(gate_first: bool, script: &[(&str, std::result::Result<RateLimits, String>)]) -> Arc<Self> {
            Arc::new(Self {
                entered: Notify::new(),
                release: Notify::new(),
                gate_first,
                calls: AtomicUsize::new(0),
                script: script
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            })
        }
    }

    impl Prober for GatedProber {
        fn probe<'a>(&'a self, account: &'a Account) -> ProbeFuture<'a> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if self.gate_first && call == 0 {
                    self.entered.notify_one();
                    self.release.notified().await;
                }
                self.script
                    .get(account.alias())
                    .cloned()
                    .unwrap_or_else(|| Err("unscripted".into()))
            })
        }
    }

    fn three_accounts() -> Vec<Account> {
        vec![
            account("a", FUTURE_EXPIRY),
            account("b", FUTURE_EXPIRY),
            account("c", FUTURE_EXPIRY),
        ]
    }

    #[tokio::test]
    async fn sweep_probes_every_account_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = seed(&dir, three_accounts()).await;
        let prober = GatedProber::new(
            false,
            &[
                ("a", Ok(limits(70.0))),
                ("b", Err("exchange timed out".into())),
                ("c", Ok(limits(10.0))),
            ],
        );
        let queue = Arc::new(RefreshQueue::new(store.clone(), prober));

        queue.start().await.unwrap();
        let progress = queue.wait().await;

        assert_eq!(progress.state, QueueState::Completed);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 3);
        assert_eq!(progress.errors, 1);
        assert!(progress.current_account.is_none());
        let aliases: Vec<_> = progress.results.iter().map(|r| r.alias.as_str()).collect();
        assert_eq!(aliases, ["a", "b", "c"]);

        let after = store.load().await;
        assert_eq!(after.accounts[0].limit_status, LimitStatus::Success);
        assert_eq!(
            after.accounts[0].rate_limits.five_hour.as_ref().unwrap().remaining,
            Some(70.0)
        );
        assert_eq!(after.accounts[1].limit_status, LimitStatus::Error);
        assert_eq!(after.accounts[1].limit_error.as_deref(), Some("exchange timed out"));
        assert_eq!(
            after.accounts[2].rate_limits.five_hour.as_ref().unwrap().remaining,
            Some(10.0)
        );
    }

    #[tokio::test]
    async fn stop_after_first_target_marks_rest_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let store = seed(&dir, three_accounts()).await;
        let prober = GatedProber::new(
            true,
            &[
                ("a", Ok(limits(55.0))),
                ("b", Ok(limits(1.0))),
                ("c", Ok(limits(1.0))),
            ],
        );
        let queue = Arc::new(RefreshQueue::new(store.clone(), prober.clone()));

        queue.start().await.unwrap();
        prober.entered.notified().await;

        let in_flight = queue.progress().await;
        assert!(in_flight.is_running());
        assert_eq!(in_flight.current_account.as_deref(), Some("a"));
        assert!(queue.request_stop().await);

        prober.release.notify_one();
        let progress = queue.wait().await;

        assert!(!progress.is_running());
        assert!(progress.is_stopped());
        assert_eq!(progress.completed, 1);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
        assert_eq!(progress.results[0].status, LimitStatus::Success);
        for result in &progress.results[1..] {
            assert_eq!(result.status, LimitStatus::Stopped);
            assert_eq!(result.error.as_deref(), Some(STOPPED_RESULT));
        }

        let after = store.load().await;
        assert_eq!(
            after.accounts[0].rate_limits.five_hour.as_ref().unwrap().remaining,
            Some(55.0)
        );
        assert_eq!(after.accounts[1].limit_status, LimitStatus::Stopped);
        assert_eq!(after.accounts[2].limit_status, LimitStatus::Stopped);
        assert!(after.accounts[2].rate_limits.is_empty());
    }

    #[tokio::test]
    async fn start_while_running_returns_in_flight_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = seed(&dir, three_accounts()).await;
        let prober = GatedProber::new(
            true,
            &[
                ("a", Ok(limits(1.0))),
                ("b", Ok(limits(1.0))),
                ("c", Ok(limits(1.0))),
            ],
        );
        let queue = Arc::new(RefreshQueue::new(store.clone(), prober.clone()));

        queue.start().await.unwrap();
        prober.entered.notified().await;

        let again = queue.start().await.unwrap();
        assert!(again.is_running());
        assert_eq!(again.current_account.as_deref(), Some("a"));
        assert_eq!(
            store.load().await.accounts[0].limit_status,
            LimitStatus::Running
        );

        prober.release.notify_one();
        let progress = queue.wait().await;
        assert_eq!(progress.state, QueueState::Completed);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = seed(&dir, vec![]).await;
        let queue = Arc::new(RefreshQueue::new(store, GatedProber::new(false, &[])));

        assert!(!queue.request_stop().await);
        queue.start().await.unwrap();
        let progress = queue.wait().await;
        assert_eq!(progress.state, QueueState::Completed);
        assert_eq!(progress.total, 0);
    }
}
