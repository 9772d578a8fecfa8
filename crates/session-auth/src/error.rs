//! Authentication error types.

use credential_storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Why a link callback was refused before any exchange call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRejection {
    /// No pending state for the provider (never started, or already consumed).
    NotFound,
    /// Pending state outlived the link-state TTL.
    Expired,
    /// Received state differs from the stored nonce.
    Mismatch,
}

impl fmt::Display for LinkRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LinkRejection::NotFound => "state not found",
            LinkRejection::Expired => "state expired",
            LinkRejection::Mismatch => "state mismatch",
        };
        f.write_str(text)
    }
}

/// Outcome error of one refresh round.
///
/// `Clone` so one round's failure can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The store holds no refresh token
    #[error("no refresh token available")]
    NoRefreshToken,

    /// Token endpoint answered with a non-success status
    #[error("refresh rejected with HTTP {status}: {detail}")]
    Rejected { status: u16, detail: String },

    /// Token endpoint answered 2xx with a body we could not use
    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    /// Transport failure before a response arrived
    #[error("network unavailable: {0}")]
    Network(String),

    /// Credential storage failed while reading or writing the pair
    #[error("credential storage failed: {0}")]
    Storage(String),

    /// Waiter detached by `force_refresh`
    #[error("refresh cancelled")]
    Cancelled,
}

impl RefreshError {
    /// True when the credential can no longer be used and the user must sign in again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefreshError::NoRefreshToken
                | RefreshError::Rejected { .. }
                | RefreshError::InvalidResponse(_)
        )
    }
}

/// Authentication error type.
#[derive(Error, Debug)]
pub enum AuthError {
    /// No credential to refresh with
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Backend rejected the refresh token
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Caller was detached from a refresh by `force_refresh`
    #[error("Token refresh cancelled")]
    RefreshCancelled,

    /// Request still returned 401 after a successful refresh
    #[error("Unauthorized")]
    Unauthorized,

    /// OAuth link callback failed state validation
    #[error("OAuth state rejected for {provider}: {reason}")]
    CsrfStateMismatch {
        provider: String,
        reason: LinkRejection,
    },

    /// Provider name is not a valid slug
    #[error("Invalid provider name: {0}")]
    InvalidProvider(String),

    /// Provider integration is not available on the backend
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Link exchange rejected by the backend
    #[error("Link exchange failed with HTTP {status}: {detail}")]
    LinkExchangeFailed { status: u16, detail: String },

    /// Login exchange rejected by the backend
    #[error("Sign-in failed: {0}")]
    SignInFailed(String),

    /// Non-success response the caller asked us to interpret
    #[error("HTTP {status}: {detail}")]
    Api { status: u16, detail: String },

    /// Invalid state transition in the session FSM
    #[error("Invalid session state transition: {0}")]
    InvalidStateTransition(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Network unavailable (transient error, can retry)
    #[error("Network unavailable")]
    NetworkUnavailable,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Returns true if this error forces the session out of `Authenticated`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::NoRefreshToken | AuthError::RefreshFailed(_) | AuthError::Unauthorized
        )
    }

    /// Returns true if this error is transient and the operation can be retried.
    ///
    /// Transient errors leave the session state unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::NetworkUnavailable | AuthError::Timeout | AuthError::RefreshCancelled => {
                true
            }
            AuthError::Api { status, .. } => *status >= 500,
            AuthError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }
}

impl From<RefreshError> for AuthError {
    fn from(error: RefreshError) -> Self {
        match error {
            RefreshError::NoRefreshToken => AuthError::NoRefreshToken,
            RefreshError::Rejected { .. } | RefreshError::InvalidResponse(_) => {
                AuthError::RefreshFailed(error.to_string())
            }
            RefreshError::Network(_) => AuthError::NetworkUnavailable,
            RefreshError::Storage(message) => AuthError::Storage(StorageError::Platform(message)),
            RefreshError::Cancelled => AuthError::RefreshCancelled,
        }
    }
}

/// Result type alias using AuthError.
pub type AuthResult<T> = Result<T, AuthError>;
