//! Credential store: the single owner of the token pair.
//!
//! Every operation runs under one `RwLock` around the backend. Writers hold
//! the write half for the whole multi-key update, so a reader can never see
//! an access token from one grant next to a refresh token from another.
//! If a backend was left half-written by a crash, readers treat the pair as
//! absent.

use crate::{
    Credential, OAuthLinkState, SecureStorage, StorageError, StorageKeys, StorageResult, User,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Non-secret metadata stored next to the token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialMeta {
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// High-level API over a [`SecureStorage`] backend.
pub struct CredentialStore {
    storage: RwLock<Box<dyn SecureStorage>>,
}

impl CredentialStore {
    /// Create a new credential store with the given storage backend.
    pub fn new(storage: Box<dyn SecureStorage>) -> Self {
        Self {
            storage: RwLock::new(storage),
        }
    }

    // ==========================================
    // Token pair
    // ==========================================

    /// Replace the stored credential.
    ///
    /// Writes refresh token, then access token, then metadata. If any write
    /// fails, both tokens are removed so no mixed pair survives.
    pub fn save(&self, credential: &Credential) -> StorageResult<()> {
        validate(credential)?;
        let storage = self.storage.write();
        write_pair(storage.as_ref(), credential)
    }

    /// Apply a refresh grant.
    ///
    /// `refresh_token` is `None` when the server did not rotate it; the
    /// currently stored refresh token is kept in that case.
    pub fn update_after_refresh(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<Credential> {
        let storage = self.storage.write();

        let refresh_token = match refresh_token {
            Some(rotated) => rotated.to_string(),
            None => storage
                .get(StorageKeys::REFRESH_TOKEN)?
                .ok_or_else(|| StorageError::NotFound(StorageKeys::REFRESH_TOKEN.to_string()))?,
        };

        let credential = Credential {
            access_token: access_token.to_string(),
            refresh_token,
            expires_at,
        };
        validate(&credential)?;
        write_pair(storage.as_ref(), &credential)?;
        Ok(credential)
    }

    /// Read the full credential, or `None` when absent or half-written.
    pub fn credential(&self) -> StorageResult<Option<Credential>> {
        let storage = self.storage.read();
        read_pair(storage.as_ref())
    }

    /// Current access token.
    pub fn get_access(&self) -> StorageResult<Option<String>> {
        Ok(self.credential()?.map(|c| c.access_token))
    }

    /// Current refresh token.
    pub fn get_refresh(&self) -> StorageResult<Option<String>> {
        Ok(self.credential()?.map(|c| c.refresh_token))
    }

    /// True when both tokens are present.
    pub fn has_credential(&self) -> StorageResult<bool> {
        Ok(self.credential()?.is_some())
    }

    /// True when a credential exists and its access token expires within `leeway`.
    pub fn needs_refresh(&self, leeway: Duration) -> StorageResult<bool> {
        let leeway = chrono::Duration::from_std(leeway)
            .map_err(|e| StorageError::Invalid(format!("refresh leeway out of range: {}", e)))?;
        Ok(self
            .credential()?
            .map(|c| c.expires_within(leeway, Utc::now()))
            .unwrap_or(false))
    }

    /// Remove the token pair, its metadata and every pending link state.
    ///
    /// Idempotent: clearing an empty store succeeds. The cached profile is
    /// left alone; the session clears it when it leaves `Authenticated`.
    pub fn clear(&self) -> StorageResult<()> {
        let storage = self.storage.write();
        let mut first_error = delete_all(
            storage.as_ref(),
            &[
                StorageKeys::ACCESS_TOKEN,
                StorageKeys::REFRESH_TOKEN,
                StorageKeys::CREDENTIAL_META,
            ],
        )
        .err();

        if let Err(e) = clear_link_states_locked(storage.as_ref()) {
            first_error.get_or_insert(e);
        }

        debug!("Credential store cleared");
        first_error.map_or(Ok(()), Err)
    }

    // ==========================================
    // Cached profile
    // ==========================================

    pub fn set_cached_user(&self, user: &User) -> StorageResult<()> {
        let json = serde_json::to_string(user).map_err(|e| StorageError::Encoding(e.to_string()))?;
        self.storage.write().set(StorageKeys::CACHED_USER, &json)
    }

    pub fn cached_user(&self) -> StorageResult<Option<User>> {
        match self.storage.read().get(StorageKeys::CACHED_USER)? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StorageError::Encoding(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn clear_cached_user(&self) -> StorageResult<()> {
        self.storage.write().delete(StorageKeys::CACHED_USER)?;
        Ok(())
    }

    // ==========================================
    // OAuth link states
    // ==========================================

    /// Persist a link state, replacing any pending one for the same provider.
    pub fn save_link_state(&self, state: &OAuthLinkState) -> StorageResult<()> {
        let json =
            serde_json::to_string(state).map_err(|e| StorageError::Encoding(e.to_string()))?;
        let storage = self.storage.write();
        storage.set(&StorageKeys::oauth_state(&state.provider), &json)?;

        let mut index = read_index(storage.as_ref())?;
        if !index.iter().any(|p| p == &state.provider) {
            index.push(state.provider.clone());
            write_index(storage.as_ref(), &index)?;
        }
        Ok(())
    }

    /// Read and delete the link state for `provider` in one critical section.
    ///
    /// The state is gone afterwards whatever the caller decides about it.
    pub fn take_link_state(&self, provider: &str) -> StorageResult<Option<OAuthLinkState>> {
        let storage = self.storage.write();
        let stored = read_link_state(storage.as_ref(), provider)?;
        remove_link_state(storage.as_ref(), provider)?;
        Ok(stored)
    }

    /// Delete the link state for `provider` only if it still holds `nonce`.
    ///
    /// Returns whether a state was removed. A newer state saved by another
    /// `start` for the same provider is left in place.
    pub fn discard_link_state(&self, provider: &str, nonce: &str) -> StorageResult<bool> {
        let storage = self.storage.write();
        match read_link_state(storage.as_ref(), provider)? {
            Some(stored) if stored.nonce == nonce => {
                remove_link_state(storage.as_ref(), provider)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// True when a link state is pending for `provider`.
    pub fn has_link_state(&self, provider: &str) -> StorageResult<bool> {
        self.storage.read().has(&StorageKeys::oauth_state(provider))
    }

    /// Remove every pending link state.
    pub fn clear_link_states(&self) -> StorageResult<()> {
        let storage = self.storage.write();
        clear_link_states_locked(storage.as_ref())
    }
}

fn validate(credential: &Credential) -> StorageResult<()> {
    if credential.access_token.is_empty() || credential.refresh_token.is_empty() {
        return Err(StorageError::Invalid(
            "credential requires both an access and a refresh token".to_string(),
        ));
    }
    Ok(())
}

fn write_pair(storage: &dyn SecureStorage, credential: &Credential) -> StorageResult<()> {
    let meta = serde_json::to_string(&CredentialMeta {
        expires_at: credential.expires_at,
    })
    .map_err(|e| StorageError::Encoding(e.to_string()))?;

    let result = storage
        .delete(StorageKeys::ACCESS_TOKEN)
        .and_then(|_| storage.set(StorageKeys::REFRESH_TOKEN, &credential.refresh_token))
        .and_then(|_| storage.set(StorageKeys::ACCESS_TOKEN, &credential.access_token))
        .and_then(|_| storage.set(StorageKeys::CREDENTIAL_META, &meta));

    if let Err(e) = result {
        warn!(error = %e, "Credential write failed, removing partial pair");
        let _ = delete_all(
            storage,
            &[
                StorageKeys::ACCESS_TOKEN,
                StorageKeys::REFRESH_TOKEN,
                StorageKeys::CREDENTIAL_META,
            ],
        );
        return Err(e);
    }

    Ok(())
}

fn read_pair(storage: &dyn SecureStorage) -> StorageResult<Option<Credential>> {
    let refresh_token = storage.get(StorageKeys::REFRESH_TOKEN)?;
    let access_token = storage.get(StorageKeys::ACCESS_TOKEN)?;

    match (access_token, refresh_token) {
        (Some(access_token), Some(refresh_token)) => {
            let expires_at = match storage.get(StorageKeys::CREDENTIAL_META)? {
                Some(json) => serde_json::from_str::<CredentialMeta>(&json)
                    .map(|meta| meta.expires_at)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Ignoring unreadable credential metadata");
                        None
                    }),
                None => None,
            };
            Ok(Some(Credential {
                access_token,
                refresh_token,
                expires_at,
            }))
        }
        (None, None) => Ok(None),
        (access, refresh) => {
            warn!(
                has_access = access.is_some(),
                has_refresh = refresh.is_some(),
                "Half-written credential found, treating as absent"
            );
            Ok(None)
        }
    }
}

/// Delete every key, returning the first error after attempting all of them.
fn delete_all(storage: &dyn SecureStorage, keys: &[&str]) -> StorageResult<()> {
    let mut first_error = None;
    for key in keys {
        if let Err(e) = storage.delete(key) {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn read_link_state(
    storage: &dyn SecureStorage,
    provider: &str,
) -> StorageResult<Option<OAuthLinkState>> {
    match storage.get(&StorageKeys::oauth_state(provider))? {
        Some(json) => match serde_json::from_str(&json) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(provider = %provider, error = %e, "Discarding unreadable link state");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

fn remove_link_state(storage: &dyn SecureStorage, provider: &str) -> StorageResult<()> {
    storage.delete(&StorageKeys::oauth_state(provider))?;

    let mut index = read_index(storage)?;
    let before = index.len();
    index.retain(|p| p != provider);
    if index.len() != before {
        write_index(storage, &index)?;
    }
    Ok(())
}

fn read_index(storage: &dyn SecureStorage) -> StorageResult<Vec<String>> {
    match storage.get(StorageKeys::OAUTH_STATE_INDEX)? {
        Some(json) => serde_json::from_str(&json).or_else(|e| {
            warn!(error = %e, "Resetting unreadable link state index");
            Ok(Vec::new())
        }),
        None => Ok(Vec::new()),
    }
}

fn write_index(storage: &dyn SecureStorage, index: &[String]) -> StorageResult<()> {
    if index.is_empty() {
        storage.delete(StorageKeys::OAUTH_STATE_INDEX)?;
        return Ok(());
    }
    let json = serde_json::to_string(index).map_err(|e| StorageError::Encoding(e.to_string()))?;
    storage.set(StorageKeys::OAUTH_STATE_INDEX, &json)
}

fn clear_link_states_locked(storage: &dyn SecureStorage) -> StorageResult<()> {
    let mut keys: Vec<String> = read_index(storage)?
        .iter()
        .map(|provider| StorageKeys::oauth_state(provider))
        .collect();
    for key in storage.list_keys_with_prefix(StorageKeys::OAUTH_STATE_PREFIX)? {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys.push(StorageKeys::OAUTH_STATE_INDEX.to_string());

    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    delete_all(storage, &refs)
}
