//! OAuth client defaults
//!
//! Public client configuration for the upstream provider. None of these are
//! secrets; they identify the public client application and can be
//! overridden from the service config.

/// Public OAuth client ID used for refresh-token exchanges.
pub const DEFAULT_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Token endpoint for refresh-token exchanges.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";

/// Current on-disk store schema version.
pub const STORE_VERSION: u32 = 2;

/// Tokens expiring within this window are refreshed before use.
pub const EXPIRY_SAFETY_BUFFER_MS: u64 = 5 * 60 * 1000;
