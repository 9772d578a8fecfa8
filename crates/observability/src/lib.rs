//! # Observability
//!
//! Tracing setup shared by every Keyward binary.
//!
//! Components never decide where logs go. They call `observability::init()`
//! (or `init_with_config`) once at startup and use plain `tracing` macros
//! everywhere else.
//!
//! When file output is enabled, every event is appended as one JSON line to
//! `~/.keyward/logs/client.jsonl`. Field values whose names denote secrets
//! (tokens, nonces, OAuth codes) are replaced with `[redacted]` before they
//! reach the file, so a stray `debug!(access_token = %t, ...)` cannot leak a
//! bearer credential to disk.
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "keyward-cli".into(),
//!         default_level: "debug".into(),
//!         file_output: true,
//!         ..Default::default()
//!     });
//!     tracing::info!("ready");
//! }
//! ```

mod file_sink;
mod json_layer;

use std::path::PathBuf;

pub use json_layer::{is_sensitive_field, LogEntry, REDACTED};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service (e.g., "keyward-cli").
    /// Included in every JSONL line for filtering.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional custom log file path.
    /// Defaults to `~/.keyward/logs/client.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Write structured JSONL to `log_path`.
    pub file_output: bool,

    /// Emit compact human-readable logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            file_output: false,
            also_stderr: true,
        }
    }
}

/// Initialize the observability layer with default settings.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize the observability layer with custom configuration.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init_with_config(config: LogConfig) {
    if config.file_output {
        file_sink::init_file_subscriber(&config);
        return;
    }

    use tracing_subscriber::util::SubscriberInitExt;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.default_level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .finish()
        .try_init();
}

fn env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "unknown");
        assert_eq!(config.default_level, "info");
        assert!(config.log_path.is_none());
        assert!(!config.file_output);
        assert!(config.also_stderr);
    }
}
