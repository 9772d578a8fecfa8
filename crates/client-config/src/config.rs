//! Client configuration.

use crate::{ConfigError, ConfigResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default backend URL (can be overridden at compile time via KEYWARD_API_URL env var).
pub const DEFAULT_API_BASE_URL: &str = match option_env!("KEYWARD_API_URL") {
    Some(url) => url,
    None => "https://api.keyward.dev",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOGOUT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_REFRESH_LEEWAY_SECS: u64 = 60;
const DEFAULT_LINK_STATE_TTL_SECS: u64 = 600;

/// Where credentials are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// OS keychain (Keychain, Secret Service, Credential Vault).
    Keychain,
    /// ChaCha20-Poly1305 encrypted file under the base directory.
    EncryptedFile,
    /// Process memory only; nothing survives exit.
    Memory,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Keychain
    }
}

/// Main client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Backend base URL for token and provider endpoints.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Per-request timeout for backend calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Upper bound on the best-effort logout call during sign-out.
    #[serde(default = "default_logout_timeout_secs")]
    pub logout_timeout_secs: u64,
    /// Refresh proactively when the access token expires within this window.
    #[serde(default = "default_refresh_leeway_secs")]
    pub refresh_leeway_secs: u64,
    /// OAuth link state older than this is rejected on callback.
    #[serde(default = "default_link_state_ttl_secs")]
    pub link_state_ttl_secs: u64,
    /// Credential storage backend.
    #[serde(default)]
    pub storage_backend: StorageBackend,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_logout_timeout_secs() -> u64 {
    DEFAULT_LOGOUT_TIMEOUT_SECS
}

fn default_refresh_leeway_secs() -> u64 {
    DEFAULT_REFRESH_LEEWAY_SECS
}

fn default_link_state_ttl_secs() -> u64 {
    DEFAULT_LINK_STATE_TTL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            logout_timeout_secs: DEFAULT_LOGOUT_TIMEOUT_SECS,
            refresh_leeway_secs: DEFAULT_REFRESH_LEEWAY_SECS,
            link_state_ttl_secs: DEFAULT_LINK_STATE_TTL_SECS,
            storage_backend: StorageBackend::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> ConfigResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> ConfigResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        let path = paths.config_file();
        std::fs::write(&path, content).map_err(|source| ConfigError::Write { path, source })
    }

    fn load_from_env(&mut self) {
        if let Some(log_level) = non_empty_env("KEYWARD_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(api_url) = non_empty_env("KEYWARD_API_URL") {
            self.api_base_url = api_url;
        }
    }

    /// Reject values that would make the auth flows misbehave.
    pub fn validate(&self) -> ConfigResult<()> {
        self.api_base_url()?;
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "request_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.link_state_ttl_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "link_state_ttl_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Get the backend URL as a parsed URL.
    pub fn api_base_url(&self) -> ConfigResult<Url> {
        Url::parse(&self.api_base_url).map_err(|source| ConfigError::InvalidUrl {
            value: self.api_base_url.clone(),
            source,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn logout_timeout(&self) -> Duration {
        Duration::from_secs(self.logout_timeout_secs)
    }

    pub fn refresh_leeway(&self) -> Duration {
        Duration::from_secs(self.refresh_leeway_secs)
    }

    pub fn link_state_ttl(&self) -> Duration {
        Duration::from_secs(self.link_state_ttl_secs)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}
