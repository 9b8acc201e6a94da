//! JWT claim extraction
//!
//! Reads the payload segment of id and access tokens without verifying the
//! signature. The values only label and locate accounts; they are never used
//! for an authorization decision.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

/// Claim namespace the provider uses for account metadata.
const AUTH_CLAIM: &str = "https://api.openai.com/auth";

/// Fields of interest from a token payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdTokenClaims {
    pub email: Option<String>,
    pub account_id: Option<String>,
    /// `exp` converted to unix milliseconds.
    pub expires_at: Option<u64>,
}

impl IdTokenClaims {
    /// Decode the payload of a compact JWT. Returns `None` for anything that
    /// is not three dot-separated segments with a JSON object in the middle.
    pub fn decode(token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let value: Value = serde_json::from_slice(&bytes).ok()?;
        if !value.is_object() {
            return None;
        }

        let email = value
            .get("email")
            .and_then(Value::as_str)
            .map(str::to_string);
        let account_id = value
            .get(AUTH_CLAIM)
            .and_then(|auth| auth.get("chatgpt_account_id"))
            .or_else(|| value.get("account_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let expires_at = value
            .get("exp")
            .and_then(Value::as_u64)
            .map(|secs| secs.saturating_mul(1000));

        Some(Self {
            email,
            account_id,
            expires_at,
        })
    }
}
