//! # kiln_agent
//!
//! Code-generation agent contract for kiln.
//!
//! The agent itself is an external collaborator: given a sandbox and a
//! prompt it writes files and runs commands inside the sandbox. This crate
//! defines that contract and the plumbing around it:
//!
//! - [`CodingAgent`]: the `run(sandbox, task)` contract the workflow relies on
//! - [`ToolCall`] / [`ToolExecutor`]: the fixed tool set (terminal, file
//!   write/read/list, code execution) and its handlers against a sandbox
//! - [`system_prompt`]: the template-aware system prompt
//! - [`HttpAgent`]: a tool-calling loop against a remote model endpoint
//! - [`ScriptedAgent`]: a recording test double

pub mod agent;
pub mod error;
pub mod http;
pub mod mock;
pub mod prompt;
pub mod tools;

pub use agent::{AgentConfig, AgentReport, AgentTask, CodingAgent, DEFAULT_MAX_ITERATIONS, DEFAULT_MODEL};
pub use error::{AgentError, AgentResult};
pub use http::HttpAgent;
pub use mock::{RecordedTask, ScriptedAgent};
pub use prompt::{system_prompt, PromptContext};
pub use tools::{AgentTool, FileSpec, ToolCall, ToolDefinition, ToolExecutor};
