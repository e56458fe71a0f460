//! Configuration for the worldsync server
//!
//! Settings are layered: `config/default.yaml`, then `config/{env}.yaml`,
//! then environment variables with the `WORLDSYNC` prefix. Per-sync-group
//! replication parameters do NOT live here; they come from the store and
//! are reloaded on admin request.

pub mod settings;

pub use settings::{
    load_settings, ContextMode, DatabaseConfig, ObservabilityConfig, ReplicationConfig,
    RuntimeEnvironment, ServerConfig, SessionConfig, Settings,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
