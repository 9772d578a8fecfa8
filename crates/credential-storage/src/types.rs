//! Values owned by the credential store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Access/refresh token pair with an optional access token expiry.
///
/// Both tokens are always present together; there is no partial credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: None,
        }
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the expiry from a server-provided `expires_in` (seconds from now).
    pub fn with_expires_in(self, expires_in_secs: i64) -> Self {
        self.with_expires_at(Utc::now() + Duration::seconds(expires_in_secs))
    }

    /// True when the access token expires within `leeway` of `now`.
    /// A credential without a known expiry never counts as expiring.
    pub fn expires_within(&self, leeway: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at.signed_duration_since(now) < leeway,
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Read-only user profile returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

/// Pending third-party link attempt, single use.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthLinkState {
    pub provider: String,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
}

impl OAuthLinkState {
    pub fn new(provider: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            nonce: nonce.into(),
            created_at: Utc::now(),
        }
    }

    /// True when the state is older than `ttl` at `now`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) > ttl
    }
}

impl fmt::Debug for OAuthLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthLinkState")
            .field("provider", &self.provider)
            .field("nonce", &"[redacted]")
            .field("created_at", &self.created_at)
            .finish()
    }
}
