//! Error types for the core module.

use kiln_agent::AgentError;
use kiln_sandbox::SandboxError;
use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur during core operations.
///
/// Launch failures are not errors; they are reported as
/// [`AttemptResult`](crate::launcher::AttemptResult) values.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid failure pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid workflow state: {0}")]
    InvalidState(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Workflow failed after {attempts} attempt(s): {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("Event bus closed")]
    DispatcherClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Whether re-running the workflow could change the outcome.
    ///
    /// Input and configuration errors fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CoreError::UnknownTemplate(_)
                | CoreError::InvalidRequest(_)
                | CoreError::InvalidPattern(_)
                | CoreError::RetriesExhausted { .. }
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(e: serde_yaml::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
