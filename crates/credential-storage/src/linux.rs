//! Linux Secret Service backend.

use crate::{SecureStorage, StorageError, StorageResult};
use secret_service::blocking::{Collection, SecretService};
use secret_service::EncryptionType;
use std::collections::HashMap;
use tracing::debug;

/// Items in the default Secret Service collection, tagged with
/// `service` and `key` attributes.
pub struct SecretServiceStorage {
    service_name: String,
}

impl SecretServiceStorage {
    /// Fails early when no Secret Service is reachable on the session bus.
    pub fn new(service_name: &str) -> StorageResult<Self> {
        SecretService::connect(EncryptionType::Dh).map_err(|e| {
            StorageError::Platform(format!("Secret Service unavailable: {}", e))
        })?;

        Ok(Self {
            service_name: service_name.to_string(),
        })
    }

    fn with_collection<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Collection) -> StorageResult<T>,
    {
        let ss = SecretService::connect(EncryptionType::Dh).map_err(platform)?;
        let collection = ss.get_default_collection().map_err(platform)?;

        if collection.is_locked().unwrap_or(false) {
            collection.unlock().map_err(|e| {
                StorageError::Platform(format!("Failed to unlock collection: {}", e))
            })?;
        }

        f(&collection)
    }

    fn attributes<'a>(&'a self, key: &'a str) -> HashMap<&'a str, &'a str> {
        HashMap::from([("service", self.service_name.as_str()), ("key", key)])
    }
}

fn platform(e: secret_service::Error) -> StorageError {
    StorageError::Platform(e.to_string())
}

impl SecureStorage for SecretServiceStorage {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        debug!(service = %self.service_name, key = %key, "Writing secret");

        self.with_collection(|collection| {
            let label = format!("{}/{}", self.service_name, key);
            collection
                .create_item(&label, self.attributes(key), value.as_bytes(), true, "text/plain")
                .map_err(platform)?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.with_collection(|collection| {
            let items = collection.search_items(self.attributes(key)).map_err(platform)?;
            let Some(item) = items.first() else {
                return Ok(None);
            };

            let secret = item.get_secret().map_err(platform)?;
            String::from_utf8(secret)
                .map(Some)
                .map_err(|e| StorageError::Encoding(e.to_string()))
        })
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        debug!(service = %self.service_name, key = %key, "Deleting secret");

        self.with_collection(|collection| {
            let items = collection.search_items(self.attributes(key)).map_err(platform)?;
            if items.is_empty() {
                return Ok(false);
            }
            for item in &items {
                item.delete().map_err(platform)?;
            }
            Ok(true)
        })
    }

    fn list_keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.with_collection(|collection| {
            let filter = HashMap::from([("service", self.service_name.as_str())]);
            let items = collection.search_items(filter).map_err(platform)?;

            let mut keys = Vec::new();
            for item in &items {
                let attributes = item.get_attributes().map_err(platform)?;
                if let Some(key) = attributes.get("key") {
                    if key.starts_with(prefix) && !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}
