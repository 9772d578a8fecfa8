//! File system paths for the client.

use crate::{ConfigError, ConfigResult};
use std::path::PathBuf;

/// Manages file system paths for the client.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for client files (~/.keyward)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.keyward`.
    pub fn new() -> ConfigResult<Self> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;

        Ok(Self {
            base_dir: home.join(".keyward"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.keyward).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.keyward/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the encrypted credential file (~/.keyward/credentials.enc).
    pub fn credentials_file(&self) -> PathBuf {
        self.base_dir.join("credentials.enc")
    }

    /// Get the logs directory (~/.keyward/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the JSONL log file (~/.keyward/logs/client.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("client.jsonl")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> ConfigResult<()> {
        for dir in [self.base_dir.clone(), self.logs_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|source| ConfigError::CreateDir { path: dir, source })?;
        }
        Ok(())
    }
}
