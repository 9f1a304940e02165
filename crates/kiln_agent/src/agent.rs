//! Core agent trait and types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_sandbox::Sandbox;
use serde::{Deserialize, Serialize};

use crate::error::AgentResult;
use crate::tools::AgentTool;

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Iteration ceiling for one agent run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;

/// One unit of work handed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    /// System prompt describing the template and tool rules
    pub system_prompt: String,
    /// What the user (or the self-heal loop) asks for
    pub prompt: String,
}

impl AgentTask {
    pub fn new(system_prompt: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
        }
    }
}

/// Summary of a finished agent run.
///
/// The workflow only cares whether the run returned; the summary is for logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReport {
    /// Model round trips performed
    pub iterations: u32,
    /// Tool calls executed against the sandbox
    pub tool_calls: u32,
    /// Final assistant message, if any
    pub final_message: Option<String>,
}

/// Static agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Display name used in logs
    pub name: String,
    /// Model identifier sent to the endpoint
    pub model: String,
    /// Tools offered to the model
    pub tools: Vec<AgentTool>,
    /// Model round trips before the run stops
    pub max_iterations: u32,
    /// Timeout applied to terminal tool commands
    pub command_timeout: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Frontend Coding Agent".to_string(),
            model: DEFAULT_MODEL.to_string(),
            tools: AgentTool::all().to_vec(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            command_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// A code-generation agent.
///
/// `run` performs its work as side effects on the sandbox: writing files,
/// installing packages, executing code. Errors are infrastructure failures
/// (model unreachable, sandbox gone); a run that produced broken code still
/// returns `Ok`.
#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn run(&self, sandbox: Arc<dyn Sandbox>, task: &AgentTask) -> AgentResult<AgentReport>;
}
