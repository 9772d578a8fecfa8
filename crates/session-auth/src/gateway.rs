//! Authenticated request gateway.
//!
//! Attaches the current access token to every request and recovers from a
//! single 401 by refreshing (through the single-flight coordinator) and
//! retrying once. Any other status is handed back untouched; 403 in
//! particular never triggers a refresh.

use crate::refresh::RefreshCoordinator;
use crate::session::Session;
use crate::session_fsm::TransitionReason;
use crate::transport::{resolve_url, ApiRequest, ApiResponse, HttpTransport};
use crate::{AuthError, AuthResult};
use credential_storage::CredentialStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const STATUS_UNAUTHORIZED: u16 = 401;

pub struct Gateway {
    base_url: Url,
    transport: Arc<dyn HttpTransport>,
    store: Arc<CredentialStore>,
    coordinator: RefreshCoordinator,
    session: Arc<Session>,
    refresh_leeway: Duration,
}

impl Gateway {
    pub fn new(
        base_url: Url,
        transport: Arc<dyn HttpTransport>,
        store: Arc<CredentialStore>,
        coordinator: RefreshCoordinator,
        session: Arc<Session>,
        refresh_leeway: Duration,
    ) -> Self {
        Self {
            base_url,
            transport,
            store,
            coordinator,
            session,
            refresh_leeway,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Send `request` with the current bearer token.
    ///
    /// At most one retry per call. Errors:
    /// - `NoRefreshToken` / `RefreshFailed` when the 401 could not be recovered
    /// - `Unauthorized` when the retry is rejected as well
    /// - transport errors unchanged
    pub async fn send(&self, request: ApiRequest) -> AuthResult<ApiResponse> {
        let url = resolve_url(&self.base_url, &request.path)?;

        self.refresh_ahead_of_expiry().await?;

        let sent_token = self.store.get_access()?;
        let response = self
            .transport
            .execute(url.clone(), &request, sent_token.as_deref())
            .await?;
        if response.status != STATUS_UNAUTHORIZED {
            return Ok(response);
        }

        debug!(method = request.method.as_str(), path = %request.path, "Received 401, recovering");

        let current_token = self.store.get_access()?;
        let retry_token = match current_token {
            // Another caller's round already replaced the token we sent.
            Some(current) if sent_token.as_deref() != Some(current.as_str()) => current,
            _ => match self.coordinator.refresh_if_needed().await {
                Ok(token) => token,
                Err(e) => {
                    if e.is_terminal() {
                        self.session
                            .mark_unauthenticated(TransitionReason::RefreshFailed);
                    }
                    return Err(e);
                }
            },
        };

        let retried = self
            .transport
            .execute(url, &request, Some(&retry_token))
            .await?;
        if retried.status == STATUS_UNAUTHORIZED {
            warn!(path = %request.path, "Request rejected again after refresh");
            self.session
                .mark_unauthenticated(TransitionReason::Unauthorized);
            return Err(AuthError::Unauthorized);
        }

        Ok(retried)
    }

    /// `send` plus status check and JSON decoding.
    pub async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> AuthResult<T> {
        self.send(request).await?.error_for_status()?.json()
    }

    /// Refresh before sending when the stored token is about to expire.
    ///
    /// Only terminal failures abort the request; otherwise the request goes
    /// out with the token we have and the 401 path handles the rest.
    async fn refresh_ahead_of_expiry(&self) -> AuthResult<()> {
        if !self.store.needs_refresh(self.refresh_leeway)? {
            return Ok(());
        }

        info!("Access token near expiry, refreshing before request");
        match self.coordinator.refresh_if_needed().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_terminal() => {
                self.session
                    .mark_unauthenticated(TransitionReason::RefreshFailed);
                Err(e)
            }
            Err(e) => {
                debug!(error = %e, "Proactive refresh failed, sending with current token");
                Ok(())
            }
        }
    }
}
