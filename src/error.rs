//! Error types shared by the library and the CLI.

use thiserror::Error;

pub type VeerResult<T> = Result<T, VeerError>;

#[derive(Debug, Error)]
pub enum VeerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A caller broke an API contract (empty trace/input, mismatched sizes).
    /// These terminate the offending worker, not the whole run.
    #[error("contract violation: {0}")]
    Contract(String),

    /// Spawning or talking to the traced target failed.
    #[error("target execution failed: {0}")]
    Target(String),

    /// A binary payload (crash artifact or checkpoint) is truncated or malformed.
    #[error("malformed payload: {0}")]
    Wire(String),

    #[error("checkpoint rejected: {0}")]
    Checkpoint(String),
}
