//! Rotating pool over stored OAuth accounts
//!
//! Picks an account per request, keeps its token fresh, and folds upstream
//! feedback (rate-limit headers, 429s, auth failures) back into the store so
//! the next selection avoids accounts that cannot serve.
//!
//! Account lifecycle:
//! 1. A login or an external credential file produces a bundle → `add_or_merge`
//! 2. `RotationEngine::select` orders available accounts by strategy and asks
//!    `TokenLifecycleManager` for a valid token, falling through on failure
//! 3. `RotationEngine::report_response` merges header windows and sets a
//!    cooldown or the sticky auth-invalid flag from the response status
//! 4. Cooldowns lapse on their own; auth-invalid clears only on a
//!    successful refresh or fresh login
//! 5. Background refresh keeps tokens ahead of expiry, and `RefreshQueue`
//!    probes true capacity for accounts without recent traffic

pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod quota;
pub mod ratelimit;
pub mod refresh;
pub mod rotation;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use lifecycle::TokenLifecycleManager;
pub use queue::{ProbeFuture, ProbeResult, Prober, QueueProgress, QueueState, RefreshQueue};
pub use quota::{ResponseClass, classify_status};
pub use ratelimit::{SessionLogEntry, SessionWindow, extract_from_headers, extract_from_session_log};
pub use refresh::spawn_refresh_task;
pub use rotation::{
    AccountState, PoolHealth, PoolStatus, RotationConfig, RotationEngine, SelectedAccount,
    Selection, Strategy,
};
pub use sync::{SyncContext, SyncOutcome, sync_external_auth};
