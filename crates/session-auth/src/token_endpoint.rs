//! Token endpoint client: refresh, login exchange and logout.
//!
//! These calls carry their own credentials in the body and bypass the
//! gateway, so a refresh can never trigger another refresh.

use crate::transport::{resolve_url, response_detail, ApiRequest, HttpTransport};
use crate::{AuthError, AuthResult, RefreshError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use credential_storage::{Credential, User};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Successful refresh response.
///
/// `refresh_token` is absent when the server did not rotate it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_in: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_in(mut self, expires_in: i64) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Absolute expiry computed from `expires_in` relative to `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in.map(|secs| now + Duration::seconds(secs))
    }
}

/// Successful login exchange: a full token pair plus the signed-in user.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginGrant {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub user: User,
}

impl LoginGrant {
    pub fn credential(&self) -> Credential {
        let credential = Credential::new(&self.access_token, &self.refresh_token);
        match self.expires_in {
            Some(secs) => credential.with_expires_in(secs),
            None => credential,
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    id_token: &'a str,
}

/// Backend token operations.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// `POST /refresh {refresh_token}`
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError>;

    /// `POST /auth/exchange {id_token}`
    async fn exchange_login(&self, id_token: &str) -> AuthResult<LoginGrant>;

    /// `POST /logout {refresh_token}`, best effort.
    async fn logout(&self, refresh_token: &str) -> AuthResult<()>;
}

/// [`TokenEndpoint`] over an [`HttpTransport`].
pub struct HttpTokenEndpoint {
    base_url: Url,
    transport: Arc<dyn HttpTransport>,
}

impl HttpTokenEndpoint {
    pub fn new(base_url: Url, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            base_url,
            transport,
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let url = resolve_url(&self.base_url, "/refresh")
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        let request = ApiRequest::post("/refresh")
            .json(&RefreshRequest { refresh_token })
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        let response = self
            .transport
            .execute(url, &request, None)
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        if !response.is_success() {
            let detail = response_detail(&response.body);
            warn!(status = response.status, detail = %detail, "Token refresh rejected");
            return Err(RefreshError::Rejected {
                status: response.status,
                detail,
            });
        }

        let grant: TokenGrant = serde_json::from_str(&response.body)
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        if grant.access_token.is_empty() {
            return Err(RefreshError::InvalidResponse(
                "empty access token".to_string(),
            ));
        }

        debug!(rotated = grant.refresh_token.is_some(), "Token refresh accepted");
        Ok(grant)
    }

    async fn exchange_login(&self, id_token: &str) -> AuthResult<LoginGrant> {
        let url = resolve_url(&self.base_url, "/auth/exchange")?;
        let request = ApiRequest::post("/auth/exchange").json(&ExchangeRequest { id_token })?;

        let response = self.transport.execute(url, &request, None).await?;
        if !response.is_success() {
            let detail = response.detail();
            warn!(status = response.status, detail = %detail, "Login exchange rejected");
            return Err(AuthError::SignInFailed(format!(
                "HTTP {}: {}",
                response.status, detail
            )));
        }

        let grant: LoginGrant = response.json()?;
        debug!(user_id = %grant.user.id, "Login exchange accepted");
        Ok(grant)
    }

    async fn logout(&self, refresh_token: &str) -> AuthResult<()> {
        let url = resolve_url(&self.base_url, "/logout")?;
        let request = ApiRequest::post("/logout").json(&RefreshRequest { refresh_token })?;

        self.transport
            .execute(url, &request, None)
            .await?
            .error_for_status()?;
        Ok(())
    }
}
