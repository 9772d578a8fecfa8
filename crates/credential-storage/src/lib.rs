//! Secure credential storage for Keyward clients.
//!
//! Two layers:
//! - [`SecureStorage`]: a flat key/value secret store with one backend per
//!   platform (**macOS** Keychain via `security-framework`, **Linux** Secret
//!   Service via `secret-service`, **Windows** Credential Vault via `windows`),
//!   plus an encrypted file backend and an in-memory backend.
//! - [`CredentialStore`]: the only owner of the access/refresh token pair,
//!   the cached user profile and pending OAuth link states. It serializes
//!   writers so readers never observe a half-written token pair.

mod credentials;
mod encrypted_file;
mod keys;
mod memory;
mod traits;
mod types;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "windows")]
mod windows;

pub use credentials::CredentialStore;
pub use encrypted_file::{derive_storage_key, EncryptedFileStorage};
pub use keys::StorageKeys;
pub use memory::MemoryStorage;
pub use traits::SecureStorage;
pub use types::{Credential, OAuthLinkState, User};

use thiserror::Error;

/// Service name used for all keychain entries.
pub const SERVICE_NAME: &str = "dev.keyward.client";

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Platform-specific storage error
    #[error("Platform storage error: {0}")]
    Platform(String),

    /// Key not found
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Value rejected before it reached the backend
    #[error("Invalid value: {0}")]
    Invalid(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Create the default platform-specific storage implementation.
pub fn create_storage() -> StorageResult<Box<dyn SecureStorage>> {
    #[cfg(target_os = "macos")]
    {
        let storage = macos::KeychainStorage::new(SERVICE_NAME)?;
        Ok(Box::new(storage))
    }

    #[cfg(target_os = "linux")]
    {
        let storage = linux::SecretServiceStorage::new(SERVICE_NAME)?;
        Ok(Box::new(storage))
    }

    #[cfg(target_os = "windows")]
    {
        let storage = windows::CredentialStorage::new(SERVICE_NAME)?;
        Ok(Box::new(storage))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        Err(StorageError::Platform(
            "No secure storage implementation available for this platform".to_string(),
        ))
    }
}

/// Create a CredentialStore backed by the platform keychain.
pub fn create_credential_store() -> StorageResult<CredentialStore> {
    let storage = create_storage()?;
    Ok(CredentialStore::new(storage))
}
