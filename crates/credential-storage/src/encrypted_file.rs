//! Encrypted file backend for hosts without a usable keychain.
//!
//! The whole map is serialized to JSON and sealed with ChaCha20-Poly1305
//! under a 32-byte key. Every write re-encrypts with a fresh nonce and
//! replaces the file through a temp file and rename.

use crate::{SecureStorage, StorageError, StorageResult};
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;
const FILE_VERSION: u32 = 1;
const NONCE_SIZE: usize = 12;
const KEY_INFO: &[u8] = b"keyward-credential-file-v1";

/// Derive the file key from a user-supplied secret with HKDF-SHA256.
pub fn derive_storage_key(secret: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut key = [0u8; 32];
    // 32 bytes is always a valid HKDF-SHA256 output length.
    let _ = hkdf.expand(KEY_INFO, &mut key);
    key
}

#[derive(Serialize, Deserialize)]
struct SealedFile {
    version: u32,
    nonce: String,
    ciphertext: String,
}

pub struct EncryptedFileStorage {
    path: PathBuf,
    cipher: ChaCha20Poly1305,
    entries: Mutex<BTreeMap<String, String>>,
}

impl EncryptedFileStorage {
    /// Open (or lazily create) the file at `path`.
    ///
    /// Fails if the file exists but cannot be decrypted with `key`.
    pub fn open(path: impl AsRef<Path>, key: [u8; 32]) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            unseal(&cipher, &raw)?
        } else {
            BTreeMap::new()
        };

        debug!(path = %path.display(), entries = entries.len(), "Opened encrypted credential file");
        Ok(Self {
            path,
            cipher,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        let sealed = seal(&self.cipher, entries)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            restrict_permissions(&file)?;
            file.write_all(sealed.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn seal(cipher: &ChaCha20Poly1305, entries: &BTreeMap<String, String>) -> StorageResult<String> {
    let plaintext =
        serde_json::to_vec(entries).map_err(|e| StorageError::Encoding(e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
        .map_err(|e| StorageError::Encoding(format!("encryption failed: {}", e)))?;

    serde_json::to_string(&SealedFile {
        version: FILE_VERSION,
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
    .map_err(|e| StorageError::Encoding(e.to_string()))
}

fn unseal(cipher: &ChaCha20Poly1305, raw: &str) -> StorageResult<BTreeMap<String, String>> {
    let sealed: SealedFile =
        serde_json::from_str(raw).map_err(|e| StorageError::Encoding(e.to_string()))?;
    if sealed.version != FILE_VERSION {
        return Err(StorageError::Encoding(format!(
            "unsupported credential file version {}",
            sealed.version
        )));
    }

    let nonce = BASE64
        .decode(&sealed.nonce)
        .map_err(|e| StorageError::Encoding(e.to_string()))?;
    if nonce.len() != NONCE_SIZE {
        return Err(StorageError::Encoding(format!(
            "invalid nonce length: expected {}, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .map_err(|e| StorageError::Encoding(e.to_string()))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| StorageError::Encoding("credential file could not be decrypted".to_string()))?;

    serde_json::from_slice(&plaintext).map_err(|e| StorageError::Encoding(e.to_string()))
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> StorageResult<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> StorageResult<()> {
    Ok(())
}

impl SecureStorage for EncryptedFileStorage {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(key.to_string(), value.to_string());

        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut entries = self.entries.lock();
        let Some(previous) = entries.remove(key) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    fn list_keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
