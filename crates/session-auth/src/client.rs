//! Client-oriented authentication runtime.
//!
//! Builds one store, coordinator, session, gateway and link manager per
//! process and wires the coordinator's round outcomes into the session, so
//! startup, sign-in, sign-out and request handling share one authority.

use crate::gateway::Gateway;
use crate::oauth_link::OAuthLinkManager;
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::session::Session;
use crate::session_fsm::{SessionState, TransitionReason};
use crate::token_endpoint::{HttpTokenEndpoint, TokenEndpoint};
use crate::transport::{ApiRequest, HttpTransport, ReqwestTransport};
use crate::AuthResult;
use credential_storage::{CredentialStore, User};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Timing knobs for the auth runtime.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Upper bound on the best-effort logout call.
    pub logout_timeout: Duration,
    /// Refresh ahead of requests when the access token expires within this window.
    pub refresh_leeway: Duration,
    /// Maximum age of a pending OAuth link state.
    pub link_state_ttl: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            logout_timeout: Duration::from_secs(5),
            refresh_leeway: Duration::from_secs(60),
            link_state_ttl: Duration::from_secs(600),
        }
    }
}

/// Shared client auth runtime.
#[derive(Clone)]
pub struct AuthClient {
    store: Arc<CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    coordinator: RefreshCoordinator,
    session: Arc<Session>,
    gateway: Arc<Gateway>,
    links: Arc<OAuthLinkManager>,
    settings: AuthSettings,
}

impl AuthClient {
    /// Runtime talking to `base_url` over reqwest.
    pub fn new(
        base_url: Url,
        store: Arc<CredentialStore>,
        settings: AuthSettings,
    ) -> AuthResult<Self> {
        let transport: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(settings.request_timeout)?);
        Ok(Self::with_transport(base_url, store, transport, settings))
    }

    /// Runtime over a custom transport; the token endpoint shares it.
    pub fn with_transport(
        base_url: Url,
        store: Arc<CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        settings: AuthSettings,
    ) -> Self {
        let endpoint: Arc<dyn TokenEndpoint> =
            Arc::new(HttpTokenEndpoint::new(base_url.clone(), transport.clone()));
        Self::from_parts(base_url, store, transport, endpoint, settings)
    }

    /// Runtime over a custom transport and token endpoint.
    pub fn from_parts(
        base_url: Url,
        store: Arc<CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        endpoint: Arc<dyn TokenEndpoint>,
        settings: AuthSettings,
    ) -> Self {
        let session = Arc::new(Session::new(store.clone()));
        let coordinator = RefreshCoordinator::new(store.clone(), endpoint.clone());
        coordinator.set_listener({
            let session = session.clone();
            Arc::new(move |outcome: &RefreshOutcome| session.handle_refresh_outcome(outcome))
        });

        let gateway = Arc::new(Gateway::new(
            base_url,
            transport,
            store.clone(),
            coordinator.clone(),
            session.clone(),
            settings.refresh_leeway,
        ));
        let links = Arc::new(OAuthLinkManager::new(
            store.clone(),
            gateway.clone(),
            settings.link_state_ttl,
        ));

        Self {
            store,
            endpoint,
            coordinator,
            session,
            gateway,
            links,
            settings,
        }
    }

    /// Startup credential check.
    ///
    /// - no credential: `Unauthenticated`
    /// - profile fetched: `Authenticated(user)`
    /// - terminal auth error: `Unauthenticated` (the refresh path already cleared the store)
    /// - offline with a cached profile: `Authenticated(cached)`; without one,
    ///   `Unauthenticated` with the credential kept for the next start
    pub async fn restore_session(&self) -> AuthResult<SessionState> {
        if !self.store.has_credential()? {
            info!("No stored credential");
            self.session
                .mark_unauthenticated(TransitionReason::NoCredential);
            return Ok(self.session.state());
        }

        self.session.begin_check()?;

        match self.fetch_profile().await {
            Ok(user) => {
                info!(user_id = %user.id, "Session restored");
                self.session.establish(user)?;
            }
            Err(e) if e.is_transient() => match self.store.cached_user()? {
                Some(user) => {
                    warn!(error = %e, user_id = %user.id, "Backend unreachable, using cached profile");
                    self.session.establish(user)?;
                }
                None => {
                    warn!(error = %e, "Backend unreachable and no cached profile");
                    self.session
                        .mark_unauthenticated(TransitionReason::ProfileUnavailable);
                }
            },
            Err(e) if e.is_terminal() => {
                info!(error = %e, "Stored credential no longer valid");
                self.session
                    .mark_unauthenticated(TransitionReason::RefreshFailed);
            }
            Err(e) => {
                warn!(error = %e, "Profile check failed");
                self.session
                    .mark_unauthenticated(TransitionReason::ProfileUnavailable);
            }
        }

        Ok(self.session.state())
    }

    /// Exchange an externally obtained identity token for a session.
    pub async fn sign_in(&self, id_token: &str) -> AuthResult<User> {
        self.session.begin_sign_in()?;

        let grant = match self.endpoint.exchange_login(id_token).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                self.session
                    .mark_unauthenticated(TransitionReason::SignInFailed);
                return Err(e);
            }
        };

        // A round left over from the previous session must not clear the new pair.
        let saved = self
            .coordinator
            .cancel_round_with(|| self.store.save(&grant.credential()));
        if let Err(e) = saved {
            warn!(error = %e, "Could not persist credential after sign-in");
            self.session
                .mark_unauthenticated(TransitionReason::SignInFailed);
            return Err(e.into());
        }

        self.session.establish(grant.user.clone())?;
        info!(user_id = %grant.user.id, "Signed in");
        Ok(grant.user)
    }

    /// Sign out locally, telling the backend on a best-effort basis.
    ///
    /// The local credential is cleared even when the logout call fails or
    /// times out. An in-flight refresh is cancelled so it cannot write the
    /// pair back.
    pub async fn sign_out(&self) -> AuthResult<()> {
        match self.store.get_refresh() {
            Ok(Some(refresh_token)) => {
                match tokio::time::timeout(
                    self.settings.logout_timeout,
                    self.endpoint.logout(&refresh_token),
                )
                .await
                {
                    Ok(Ok(())) => info!("Backend session revoked"),
                    Ok(Err(e)) => warn!(error = %e, "Backend logout failed, clearing locally"),
                    Err(_) => warn!(
                        timeout_ms = self.settings.logout_timeout.as_millis() as u64,
                        "Backend logout timed out, clearing locally"
                    ),
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read refresh token for logout"),
        }

        let cleared = self.coordinator.cancel_round_with(|| self.store.clear());
        self.session.mark_unauthenticated(TransitionReason::SignedOut);
        cleared?;

        info!("Signed out");
        Ok(())
    }

    /// `GET /me` through the gateway.
    pub async fn fetch_profile(&self) -> AuthResult<User> {
        self.gateway.send_json(ApiRequest::get("/me")).await
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn links(&self) -> &OAuthLinkManager {
        &self.links
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }
}

