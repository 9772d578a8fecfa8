//! CLI command implementations.

mod auth;
mod link;
mod request;

pub use auth::{refresh, sign_in, sign_out, status};
pub use link::{link_complete, link_pending, link_start};
pub use request::get;

use anyhow::{Context, Result};
use client_config::{Config, Paths, StorageBackend};
use credential_storage::{
    create_storage, derive_storage_key, CredentialStore, EncryptedFileStorage, MemoryStorage,
    SecureStorage,
};
use session_auth::{AuthClient, AuthSettings};
use std::sync::Arc;
use tracing::debug;

/// Secret the encrypted file backend derives its key from.
const STORAGE_SECRET_ENV: &str = "KEYWARD_STORAGE_SECRET";

/// Open the credential store for the configured backend.
pub fn open_store(config: &Config, paths: &Paths) -> Result<Arc<CredentialStore>> {
    let storage: Box<dyn SecureStorage> = match config.storage_backend {
        StorageBackend::Keychain => create_storage().context("Failed to open platform keychain")?,
        StorageBackend::EncryptedFile => {
            let secret = std::env::var(STORAGE_SECRET_ENV).with_context(|| {
                format!("{} must be set for the encrypted_file backend", STORAGE_SECRET_ENV)
            })?;
            paths.ensure_dirs()?;
            let file = EncryptedFileStorage::open(
                paths.credentials_file(),
                derive_storage_key(secret.as_bytes()),
            )
            .context("Failed to open credential file")?;
            Box::new(file)
        }
        StorageBackend::Memory => Box::new(MemoryStorage::new()),
    };
    debug!(backend = ?config.storage_backend, "Opened credential storage");
    Ok(Arc::new(CredentialStore::new(storage)))
}

/// Build the auth runtime from configuration.
pub fn build_client(config: &Config, paths: &Paths) -> Result<AuthClient> {
    let settings = AuthSettings {
        request_timeout: config.request_timeout(),
        logout_timeout: config.logout_timeout(),
        refresh_leeway: config.refresh_leeway(),
        link_state_ttl: config.link_state_ttl(),
    };
    let store = open_store(config, paths)?;
    let client = AuthClient::new(config.api_base_url()?, store, settings)?;
    Ok(client)
}
