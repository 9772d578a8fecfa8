//! Storage key constants.

/// Storage keys used by the credential store.
pub struct StorageKeys;

impl StorageKeys {
    /// Bearer access token
    pub const ACCESS_TOKEN: &'static str = "access_token";

    /// Refresh token
    pub const REFRESH_TOKEN: &'static str = "refresh_token";

    /// Credential metadata (JSON, currently the access token expiry)
    pub const CREDENTIAL_META: &'static str = "credential_meta";

    /// Cached user profile (JSON)
    pub const CACHED_USER: &'static str = "cached_user";

    /// Providers with a pending OAuth link state (JSON array)
    pub const OAUTH_STATE_INDEX: &'static str = "oauth_state_index";

    /// Prefix for per-provider OAuth link states
    pub const OAUTH_STATE_PREFIX: &'static str = "oauth_state.";

    /// Key holding the pending OAuth link state for `provider`.
    pub fn oauth_state(provider: &str) -> String {
        format!("{}{}", Self::OAUTH_STATE_PREFIX, provider)
    }
}
