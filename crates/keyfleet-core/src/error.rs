//! Configuration and registry error types.
//!
//! These are the only errors that are fatal to a whole run: they fire
//! before any remote action is taken.

use thiserror::Error;

/// Errors raised while loading or validating the coordinator
/// configuration and the target registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("registry line {line}: {reason}")]
    Registry { line: usize, reason: String },

    #[error("invalid keyspace bound {value:?}: {reason}")]
    InvalidKeyspace { value: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
