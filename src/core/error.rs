/// Error taxonomy for volume operations
///
/// Every failure is reported once, with enough detail (stderr, exit code) for a
/// human to decide whether to retry.

use std::time::Duration;
use thiserror::Error;

pub type VolumeResult<T> = Result<T, VolumeError>;

#[derive(Debug, Error)]
pub enum VolumeError {
    /// The runtime daemon did not answer
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The runtime CLI itself could not be started
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{context} (exit code {}): {stderr}",
        .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string())
    )]
    CommandFailed {
        context: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    /// Export, save and transfer have nothing to copy from an empty volume
    #[error("volume {0} is empty")]
    EmptyVolume(String),

    #[error("'{command}' did not finish within {}", humantime::format_duration(*.limit))]
    Timeout { command: String, limit: Duration },

    #[error("unexpected runtime output: {0}")]
    Parse(String),

    /// The task running the operation panicked or was cancelled
    #[error("operation aborted: {0}")]
    Aborted(String),
}

impl VolumeError {
    /// HTTP status code the API reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            VolumeError::RuntimeUnavailable(_) => 503,
            VolumeError::Spawn { .. } => 500,
            VolumeError::CommandFailed { .. } => 500,
            VolumeError::Conflict(_) => 409,
            VolumeError::InvalidInput(_) => 400,
            VolumeError::NotFound(_) => 404,
            VolumeError::EmptyVolume(_) => 422,
            VolumeError::Timeout { .. } => 504,
            VolumeError::Parse(_) => 502,
            VolumeError::Aborted(_) => 500,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        VolumeError::InvalidInput(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        VolumeError::Conflict(msg.into())
    }
}
