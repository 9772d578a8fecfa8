//! Configuration, file system paths, and logging setup for Keyward clients.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, StorageBackend, DEFAULT_API_BASE_URL, DEFAULT_LOG_LEVEL};
pub use error::{ConfigError, ConfigResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
