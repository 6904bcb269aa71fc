//! Deployment error types.

use thiserror::Error;

/// Errors that can occur while deploying a worker to a target.
///
/// All of these are recoverable at the orchestration level: they
/// consume one retry attempt, and an exhausted budget demotes the
/// target rather than failing the run.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("session to {target} failed: {detail}")]
    Connect { target: String, detail: String },

    #[error("upload of {file} to {target} failed: {detail}")]
    Upload {
        target: String,
        file: String,
        detail: String,
    },

    #[error("worker launch on {target} failed: {detail}")]
    Launch { target: String, detail: String },

    #[error("operation on {target} timed out after {secs}s")]
    Timeout { target: String, secs: u64 },

    #[error("state store error: {0}")]
    State(#[from] keyfleet_state::StateError),
}

pub type DeployResult<T> = Result<T, DeployError>;
