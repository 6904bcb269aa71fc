//! Backup and recovery errors.

use thiserror::Error;

use keyfleet_state::StateError;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup i/o failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backup serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state access failed: {0}")]
    State(#[from] StateError),
}

pub type BackupResult<T> = Result<T, BackupError>;
