//! Error types for the agent module.

use kiln_sandbox::SandboxError;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while running an agent.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Model request failed: {0}")]
    Http(String),

    #[error("Model API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    #[error("Invalid tool call: {0}")]
    InvalidToolCall(String),

    #[error("Agent run failed: {0}")]
    Failed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
