//! Storage trait definitions.

use crate::StorageResult;

/// Trait for secure storage backends.
///
/// Backends are flat string maps. They make no atomicity promise across
/// keys; [`crate::CredentialStore`] layers that on top.
pub trait SecureStorage: Send + Sync {
    /// Store a value securely, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Retrieve a value.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Delete a value. Returns whether a value existed; deleting a missing
    /// key is not an error.
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Check if a key exists
    fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// List all keys that start with a given prefix.
    /// Returns an empty vec if the backend cannot enumerate.
    fn list_keys_with_prefix(&self, _prefix: &str) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }
}
