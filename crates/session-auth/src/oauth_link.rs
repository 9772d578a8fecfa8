//! Third-party account linking with CSRF-protected state.
//!
//! `start` stores a fresh nonce for the provider and asks the backend for a
//! consent URL carrying it as `state`. `complete` consumes the stored state
//! before anything else happens: a missing, expired or mismatched state
//! fails without any exchange call, and the state cannot be replayed.

use crate::gateway::Gateway;
use crate::transport::ApiRequest;
use crate::{AuthError, AuthResult, LinkRejection};
use base64::Engine;
use chrono::Utc;
use credential_storage::{CredentialStore, OAuthLinkState};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

const NONCE_BYTES: usize = 32;
const MAX_PROVIDER_LEN: usize = 32;
const STATUS_NOT_FOUND: u16 = 404;

/// Consent URL returned by `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStart {
    pub provider: String,
    pub auth_url: String,
}

/// Backend response to a successful exchange, passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkCompletion {
    pub provider: String,
    pub response: serde_json::Value,
}

#[derive(Serialize)]
struct StartRequest<'a> {
    state: &'a str,
}

#[derive(Deserialize)]
struct StartResponse {
    auth_url: String,
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    code: &'a str,
    state: &'a str,
}

pub struct OAuthLinkManager {
    store: Arc<CredentialStore>,
    gateway: Arc<Gateway>,
    state_ttl: Duration,
}

impl OAuthLinkManager {
    pub fn new(store: Arc<CredentialStore>, gateway: Arc<Gateway>, state_ttl: Duration) -> Self {
        Self {
            store,
            gateway,
            state_ttl,
        }
    }

    /// Begin linking `provider`; returns the consent URL to open.
    pub async fn start(&self, provider: &str) -> AuthResult<LinkStart> {
        validate_provider(provider)?;

        let state = OAuthLinkState::new(provider, generate_nonce());
        self.store.save_link_state(&state)?;
        debug!(provider = %provider, "Stored link state");

        let request = ApiRequest::post(format!("/providers/{}/start", provider))
            .json(&StartRequest { state: &state.nonce })?;

        match self.gateway.send_json::<StartResponse>(request).await {
            Ok(start) => {
                info!(provider = %provider, "Link flow started");
                Ok(LinkStart {
                    provider: provider.to_string(),
                    auth_url: start.auth_url,
                })
            }
            Err(e) => {
                warn!(provider = %provider, error = %e, "Link start failed, discarding state");
                match self.store.discard_link_state(provider, &state.nonce) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(provider = %provider, "Link state replaced by a newer start, keeping it")
                    }
                    Err(cleanup) => {
                        warn!(provider = %provider, error = %cleanup, "Failed to discard link state")
                    }
                }
                Err(e)
            }
        }
    }

    /// Finish linking `provider` with the callback's `state` and `code`.
    pub async fn complete(
        &self,
        provider: &str,
        received_state: &str,
        code: &str,
    ) -> AuthResult<LinkCompletion> {
        validate_provider(provider)?;

        let stored = self.store.take_link_state(provider)?;
        self.check_state(provider, stored.as_ref(), received_state)?;

        let request = ApiRequest::post(format!("/providers/{}/exchange", provider)).json(
            &ExchangeRequest {
                code,
                state: received_state,
            },
        )?;
        let response = self.gateway.send(request).await?;

        if response.status == STATUS_NOT_FOUND {
            info!(provider = %provider, "Provider integration unavailable");
            return Err(AuthError::ProviderUnavailable(provider.to_string()));
        }
        if !response.is_success() {
            let detail = response.detail();
            warn!(provider = %provider, status = response.status, detail = %detail, "Link exchange rejected");
            return Err(AuthError::LinkExchangeFailed {
                status: response.status,
                detail,
            });
        }

        let body = if response.body.trim().is_empty() {
            serde_json::Value::Null
        } else {
            response.json()?
        };

        info!(provider = %provider, "Account linked");
        Ok(LinkCompletion {
            provider: provider.to_string(),
            response: body,
        })
    }

    /// True while a link attempt for `provider` awaits its callback.
    pub fn is_pending(&self, provider: &str) -> AuthResult<bool> {
        validate_provider(provider)?;
        Ok(self.store.has_link_state(provider)?)
    }

    fn check_state(
        &self,
        provider: &str,
        stored: Option<&OAuthLinkState>,
        received_state: &str,
    ) -> AuthResult<()> {
        let reject = |reason: LinkRejection| {
            warn!(provider = %provider, reason = %reason, "Rejecting link callback");
            Err(AuthError::CsrfStateMismatch {
                provider: provider.to_string(),
                reason,
            })
        };

        let Some(stored) = stored else {
            return reject(LinkRejection::NotFound);
        };

        let ttl = chrono::Duration::from_std(self.state_ttl)
            .map_err(|e| AuthError::Config(format!("link state TTL out of range: {}", e)))?;
        if stored.is_expired(ttl, Utc::now()) {
            return reject(LinkRejection::Expired);
        }

        let matches: bool = stored
            .nonce
            .as_bytes()
            .ct_eq(received_state.as_bytes())
            .into();
        if !matches {
            return reject(LinkRejection::Mismatch);
        }

        Ok(())
    }
}

/// 32 random bytes from the OS, base64url without padding.
fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn validate_provider(provider: &str) -> AuthResult<()> {
    let valid = !provider.is_empty()
        && provider.len() <= MAX_PROVIDER_LEN
        && provider
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidProvider(provider.to_string()))
    }
}
