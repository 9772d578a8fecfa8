//! Windows Credential Vault backend.

use crate::{SecureStorage, StorageError, StorageResult};
use tracing::debug;
use windows::{
    core::HSTRING,
    Security::Credentials::{PasswordCredential, PasswordVault},
};

/// `HRESULT_FROM_WIN32(ERROR_NOT_FOUND)`
const ERROR_NOT_FOUND: u32 = 0x8007_0490;

/// Vault entries under one resource name, keyed by user name.
pub struct CredentialStorage {
    resource: HSTRING,
}

impl CredentialStorage {
    pub fn new(service_name: &str) -> StorageResult<Self> {
        vault()?;
        Ok(Self {
            resource: HSTRING::from(service_name),
        })
    }

    fn retrieve(&self, vault: &PasswordVault, key: &str) -> StorageResult<Option<PasswordCredential>> {
        match vault.Retrieve(&self.resource, &HSTRING::from(key)) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) if e.code().0 as u32 == ERROR_NOT_FOUND => Ok(None),
            Err(e) => Err(StorageError::Platform(format!(
                "Vault lookup failed for {}: {}",
                key, e
            ))),
        }
    }
}

fn vault() -> StorageResult<PasswordVault> {
    PasswordVault::new()
        .map_err(|e| StorageError::Platform(format!("Credential Vault unavailable: {}", e)))
}

impl SecureStorage for CredentialStorage {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        debug!(resource = %self.resource, key = %key, "Writing vault credential");

        let vault = vault()?;
        if let Some(existing) = self.retrieve(&vault, key)? {
            let _ = vault.Remove(&existing);
        }

        let credential = PasswordCredential::CreatePasswordCredential(
            &self.resource,
            &HSTRING::from(key),
            &HSTRING::from(value),
        )
        .map_err(|e| StorageError::Platform(e.to_string()))?;

        vault
            .Add(&credential)
            .map_err(|e| StorageError::Platform(format!("Vault write failed for {}: {}", key, e)))
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let vault = vault()?;
        let Some(credential) = self.retrieve(&vault, key)? else {
            return Ok(None);
        };

        credential
            .RetrievePassword()
            .map_err(|e| StorageError::Platform(e.to_string()))?;
        let password = credential
            .Password()
            .map_err(|e| StorageError::Platform(e.to_string()))?;
        Ok(Some(password.to_string()))
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        debug!(resource = %self.resource, key = %key, "Deleting vault credential");

        let vault = vault()?;
        match self.retrieve(&vault, key)? {
            Some(credential) => {
                vault.Remove(&credential).map_err(|e| {
                    StorageError::Platform(format!("Vault delete failed for {}: {}", key, e))
                })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let vault = vault()?;
        let credentials = match vault.FindAllByResource(&self.resource) {
            Ok(credentials) => credentials,
            Err(e) if e.code().0 as u32 == ERROR_NOT_FOUND => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Platform(e.to_string())),
        };

        let mut keys = Vec::new();
        for credential in credentials {
            let name = credential
                .UserName()
                .map_err(|e| StorageError::Platform(e.to_string()))?
                .to_string();
            if name.starts_with(prefix) {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_RESOURCE: &str = "dev.keyward.client.test";

    #[test]
    #[ignore] // Requires Windows Credential Vault access
    fn test_vault_round_trip() {
        let storage = CredentialStorage::new(TEST_RESOURCE).unwrap();
        let _ = storage.delete("test_key");

        storage.set("test_key", "first").unwrap();
        storage.set("test_key", "second").unwrap();
        assert_eq!(storage.get("test_key").unwrap(), Some("second".to_string()));

        assert!(storage.delete("test_key").unwrap());
        assert!(!storage.delete("test_key").unwrap());
        assert_eq!(storage.get("test_key").unwrap(), None);
    }
}
