//! Classification of upstream responses
//!
//! Maps an upstream status code and body to the account-state transition it
//! implies. Rate-limit and quota signals are not errors here; they become
//! cooldown timestamps on the account.

use std::time::Duration;

/// Body fragments meaning the requested model is not available to the account.
const MODEL_UNSUPPORTED_PATTERNS: &[&str] = &[
    "model_not_found",
    "unsupported model",
    "model is not supported",
    "not supported when using codex with a chatgpt account",
    "does not have access to model",
];

/// Body fragments meaning the account's workspace is no longer active.
const WORKSPACE_DEACTIVATED_PATTERNS: &[&str] = &[
    "deactivated_workspace",
    "workspace has been deactivated",
    "workspace is deactivated",
];

/// Cooldown after a model-unsupported response.
pub const MODEL_UNSUPPORTED_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Cooldown after a deactivated-workspace response.
pub const WORKSPACE_DEACTIVATED_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// What an upstream response means for the account that served it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Ok,
    RateLimited,
    AuthInvalid,
    ModelUnsupported,
    WorkspaceDeactivated,
    /// Retryable on the same account, no state change.
    Transient,
}

impl ResponseClass {
    pub fn label(&self) -> &'static str {
        match self {
            ResponseClass::Ok => "ok",
            ResponseClass::RateLimited => "rate_limited",
            ResponseClass::AuthInvalid => "auth_invalid",
            ResponseClass::ModelUnsupported => "model_unsupported",
            ResponseClass::WorkspaceDeactivated => "workspace_deactivated",
            ResponseClass::Transient => "transient",
        }
    }
}

fn contains_any(body: &str, patterns: &[&str]) -> bool {
    let lower = body.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// Classify an upstream response by HTTP status and body.
///
/// Body patterns take precedence over the status for the workspace and
/// model cases, since upstreams report both with a mix of 400/402/403/404.
/// Remaining 401/403 responses invalidate the account; 429 is a rate limit;
/// anything else non-2xx is transient.
pub fn classify_status(status: u16, body: &str) -> ResponseClass {
    if (200..300).contains(&status) {
        return ResponseClass::Ok;
    }
    if contains_any(body, WORKSPACE_DEACTIVATED_PATTERNS) {
        return ResponseClass::WorkspaceDeactivated;
    }
    match status {
        400 | 403 | 404 if contains_any(body, MODEL_UNSUPPORTED_PATTERNS) => {
            ResponseClass::ModelUnsupported
        }
        429 => ResponseClass::RateLimited,
        401 | 403 => ResponseClass::AuthInvalid,
        _ => ResponseClass::Transient,
    }
}
