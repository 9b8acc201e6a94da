//! Refresh-token exchange
//!
//! The token endpoint is reached through the `RefreshTransport` trait so the
//! lifecycle manager can be exercised without a network. `HttpRefreshTransport`
//! is the production implementation: it POSTs a `refresh_token` grant and
//! converts the response into an absolute-expiry `TokenBundle`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::account::now_millis;
use crate::claims::IdTokenClaims;
use crate::constants::{DEFAULT_CLIENT_ID, DEFAULT_TOKEN_ENDPOINT};
use crate::error::RefreshError;

/// Credential material produced by a login or refresh.
///
/// Interactive login (browser redirect or device-code polling) and token
/// refresh both end in this shape, and the store persists it the same way
/// regardless of how it was acquired. `expires_at` is absolute unix ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl TokenBundle {
    /// Fill `email` and `account_id` from the id token when they are absent.
    pub fn with_id_token_claims(mut self) -> Self {
        if let Some(claims) = self.id_token.as_deref().and_then(IdTokenClaims::decode) {
            if self.email.is_none() {
                self.email = claims.email;
            }
            if self.account_id.is_none() {
                self.account_id = claims.account_id;
            }
        }
        self
    }
}

/// Raw response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. Providers that
/// do not rotate refresh tokens omit `refresh_token`.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    pub expires_in: u64,
}

impl TokenResponse {
    /// Convert to a bundle, anchoring the expiry at `now` and keeping
    /// `previous_refresh` when the provider did not issue a new one.
    pub fn into_bundle(self, previous_refresh: &str, now: u64) -> TokenBundle {
        TokenBundle {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .unwrap_or_else(|| previous_refresh.to_string()),
            id_token: self.id_token,
            expires_at: now.saturating_add(self.expires_in.saturating_mul(1000)),
            email: None,
            account_id: None,
        }
        .with_id_token_claims()
    }
}

/// Boxed future returned by `RefreshTransport`.
pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<TokenBundle, RefreshError>> + Send + 'a>>;

/// Exchanges a refresh token for a new bundle.
///
/// Uses `Pin<Box<dyn Future>>` so implementations can be shared as
/// `Arc<dyn RefreshTransport>`.
pub trait RefreshTransport: Send + Sync {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> RefreshFuture<'a>;
}

/// Refresh transport backed by the provider's OAuth token endpoint.
#[derive(Debug, Clone)]
pub struct HttpRefreshTransport {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
}

impl HttpRefreshTransport {
    pub fn new(client: reqwest::Client, token_endpoint: String, client_id: String) -> Self {
        Self {
            client,
            token_endpoint,
            client_id,
        }
    }

    /// Transport pointed at the default public client with a request timeout.
    pub fn with_defaults(timeout: Duration) -> std::result::Result<Self, RefreshError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RefreshError::Transient(format!("building HTTP client: {e}")))?;
        Ok(Self::new(
            client,
            DEFAULT_TOKEN_ENDPOINT.to_string(),
            DEFAULT_CLIENT_ID.to_string(),
        ))
    }
}

impl RefreshTransport for HttpRefreshTransport {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> RefreshFuture<'a> {
        Box::pin(async move {
            let response =
                refresh_token_at(&self.client, &self.token_endpoint, &self.client_id, refresh_token)
                    .await?;
            Ok(response.into_bundle(refresh_token, now_millis()))
        })
    }
}

/// POST a `refresh_token` grant and classify the outcome.
///
/// 401/403 (and a 400 carrying `invalid_grant`) mean the refresh token was
/// revoked. Everything else that fails is transient.
pub async fn refresh_token_at(
    client: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    refresh: &str,
) -> std::result::Result<TokenResponse, RefreshError> {
    let response = client
        .post(token_endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", client_id),
        ])
        .send()
        .await
        .map_err(|e| RefreshError::Transient(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        debug!(%status, "token endpoint rejected refresh");
        return Err(classify_refresh_failure(status.as_u16(), &body));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| RefreshError::Transient(format!("invalid refresh response: {e}")))
}

/// Map a non-success token endpoint response to a typed failure.
pub fn classify_refresh_failure(status: u16, body: &str) -> RefreshError {
    match status {
        401 | 403 => RefreshError::Unauthorized(format!("token endpoint returned {status}: {body}")),
        400 if body.contains("invalid_grant") => {
            RefreshError::Unauthorized(format!("refresh token no longer valid: {body}"))
        }
        _ => RefreshError::Transient(format!("token endpoint returned {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_deserializes_without_refresh_token() {
        let json = r#"{"access_token":"at_abc","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert!(token.refresh_token.is_none());
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn into_bundle_converts_expiry_to_absolute_millis() {
        let token = TokenResponse {
            access_token: "at_new".into(),
            refresh_token: Some("rt_new".into()),
            id_token: None,
            expires_in: 3600,
        };
        let bundle = token.into_bundle("rt_old", 1_700_000_000_000);
        assert_eq!(bundle.expires_at, 1_700_000_000_000 + 3_600_000);
        assert_eq!(bundle.refresh_token, "rt_new");
    }

    #[test]
    fn into_bundle_keeps_previous_refresh_token() {
        let token = TokenResponse {
            access_token: "at_new".into(),
            refresh_token: None,
            id_token: None,
            expires_in: 60,
        };
        let bundle = token.into_bundle("rt_old", 0);
        assert_eq!(bundle.refresh_token, "rt_old");
    }

    #[test]
    fn unauthorized_statuses_are_sticky_failures() {
        assert!(matches!(
            classify_refresh_failure(401, "nope"),
            RefreshError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_refresh_failure(403, "forbidden"),
            RefreshError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_refresh_failure(400, r#"{"error":"invalid_grant"}"#),
            RefreshError::Unauthorized(_)
        ));
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [400, 429, 500, 502, 503] {
            assert!(
                matches!(
                    classify_refresh_failure(status, "try later"),
                    RefreshError::Transient(_)
                ),
                "status {status} must be transient"
            );
        }
    }

    #[test]
    fn bundle_roundtrips_camel_case_json() {
        let json = r#"{"accessToken":"a","refreshToken":"r","expiresAt":5,"email":"x@y.z"}"#;
        let bundle: TokenBundle = serde_json::from_str(json).unwrap();
        assert_eq!(bundle.expires_at, 5);
        assert_eq!(bundle.email.as_deref(), Some("x@y.z"));
        assert!(bundle.id_token.is_none());
    }
}
