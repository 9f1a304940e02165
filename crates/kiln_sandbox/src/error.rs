//! Error types for the sandbox module.

use thiserror::Error;

/// Result type alias for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors that can occur during sandbox operations.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox creation failed: {0}")]
    CreateFailed(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox {0} has expired")]
    Expired(String),

    #[error("Sandbox {0} was killed")]
    Killed(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Command timed out after {0}ms")]
    Timeout(u64),

    /// Error reported verbatim by the remote environment.
    #[error("{0}")]
    Remote(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
