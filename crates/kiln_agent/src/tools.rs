//! The agent tool set and its sandbox-side handlers.

use std::sync::Arc;
use std::time::Duration;

use kiln_sandbox::{CommandOptions, Sandbox};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};

/// Tools offered to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentTool {
    Terminal,
    CreateOrUpdateFiles,
    ReadFile,
    ListFiles,
    ExecuteCode,
}

impl AgentTool {
    /// Every tool, in the order they are offered.
    pub fn all() -> &'static [AgentTool] {
        &[
            AgentTool::Terminal,
            AgentTool::CreateOrUpdateFiles,
            AgentTool::ReadFile,
            AgentTool::ListFiles,
            AgentTool::ExecuteCode,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentTool::Terminal => "terminal",
            AgentTool::CreateOrUpdateFiles => "createOrUpdateFiles",
            AgentTool::ReadFile => "readFile",
            AgentTool::ListFiles => "listFiles",
            AgentTool::ExecuteCode => "executeCode",
        }
    }

    /// Name, description and JSON schema as sent to the model.
    pub fn definition(&self) -> ToolDefinition {
        let (description, parameters) = match self {
            AgentTool::Terminal => (
                "Run a terminal command in the sandbox",
                json!({
                    "type": "object",
                    "properties": { "command": { "type": "string" } },
                    "required": ["command"]
                }),
            ),
            AgentTool::CreateOrUpdateFiles => (
                "Create or update files in the project",
                json!({
                    "type": "object",
                    "properties": {
                        "files": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "path": { "type": "string" },
                                    "content": { "type": "string" }
                                },
                                "required": ["path", "content"]
                            }
                        }
                    },
                    "required": ["files"]
                }),
            ),
            AgentTool::ReadFile => (
                "Read a file's contents",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
            ),
            AgentTool::ListFiles => (
                "List files in a directory",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
            ),
            AgentTool::ExecuteCode => (
                "Execute Python code and return results (for code-interpreter template)",
                json!({
                    "type": "object",
                    "properties": { "code": { "type": "string" } },
                    "required": ["code"]
                }),
            ),
        };

        ToolDefinition {
            name: self.as_str().to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

impl std::fmt::Display for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tool description sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A file to create or overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub content: String,
}

impl FileSpec {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "camelCase")]
pub enum ToolCall {
    Terminal { command: String },
    CreateOrUpdateFiles { files: Vec<FileSpec> },
    ReadFile { path: String },
    ListFiles { path: String },
    ExecuteCode { code: String },
}

impl ToolCall {
    /// Build a call from the tool name and raw JSON arguments.
    pub fn from_parts(name: &str, arguments: serde_json::Value) -> AgentResult<Self> {
        serde_json::from_value(json!({ "name": name, "arguments": arguments }))
            .map_err(|e| AgentError::InvalidToolCall(format!("{}: {}", name, e)))
    }

    /// The tool this call targets.
    pub fn tool(&self) -> AgentTool {
        match self {
            ToolCall::Terminal { .. } => AgentTool::Terminal,
            ToolCall::CreateOrUpdateFiles { .. } => AgentTool::CreateOrUpdateFiles,
            ToolCall::ReadFile { .. } => AgentTool::ReadFile,
            ToolCall::ListFiles { .. } => AgentTool::ListFiles,
            ToolCall::ExecuteCode { .. } => AgentTool::ExecuteCode,
        }
    }
}

/// Runs tool calls against a sandbox.
pub struct ToolExecutor {
    sandbox: Arc<dyn Sandbox>,
    command_timeout: Option<Duration>,
}

impl ToolExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            command_timeout: None,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Execute a call, turning failures into text the model can read.
    pub async fn execute(&self, call: &ToolCall) -> String {
        match self.try_execute(call).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Tool {} failed in {}: {}", call.tool(), self.sandbox.id(), e);
                format!("Error: {}", e)
            }
        }
    }

    /// Execute a call, propagating failures.
    pub async fn try_execute(&self, call: &ToolCall) -> AgentResult<String> {
        debug!("Executing tool {} in {}", call.tool(), self.sandbox.id());

        match call {
            ToolCall::Terminal { command } => {
                let mut options = CommandOptions::new();
                if let Some(timeout) = self.command_timeout {
                    options = options.timeout(timeout);
                }
                let output = self.sandbox.run_command(command, options).await?;
                if output.stderr.is_empty() {
                    Ok(output.stdout)
                } else {
                    Ok(format!("{}\nSTDERR: {}", output.stdout, output.stderr))
                }
            }
            ToolCall::CreateOrUpdateFiles { files } => {
                for file in files {
                    self.sandbox.write_file(&file.path, &file.content).await?;
                }
                Ok(format!("Wrote {} file(s)", files.len()))
            }
            ToolCall::ReadFile { path } => Ok(self.sandbox.read_file(path).await?),
            ToolCall::ListFiles { path } => Ok(self.sandbox.list_files(path).await?.join("\n")),
            ToolCall::ExecuteCode { code } => {
                let output = self.sandbox.run_code(code).await?;
                if let Some(error) = output.error {
                    return Ok(format!(
                        "Error: {}: {}\n{}",
                        error.name, error.value, error.traceback
                    ));
                }
                Ok(serde_json::to_string(&json!({
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                    "results": output.results,
                }))?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_sandbox::{CreateOptions, MockResponse, MockSandboxProvider, SandboxProvider};

    async fn executor(provider: &MockSandboxProvider) -> ToolExecutor {
        let sandbox = provider.create(CreateOptions::new("t")).await.unwrap();
        ToolExecutor::new(sandbox)
    }

    #[test]
    fn test_tool_call_wire_format() {
        let call = ToolCall::from_parts(
            "createOrUpdateFiles",
            json!({ "files": [{ "path": "/a.txt", "content": "a" }] }),
        )
        .unwrap();

        assert_eq!(
            call,
            ToolCall::CreateOrUpdateFiles {
                files: vec![FileSpec::new("/a.txt", "a")]
            }
        );
        assert_eq!(call.tool(), AgentTool::CreateOrUpdateFiles);
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let result = ToolCall::from_parts("deleteEverything", json!({}));
        assert!(matches!(result, Err(AgentError::InvalidToolCall(_))));
    }

    #[test]
    fn test_definitions_cover_all_tools() {
        let names: Vec<String> = AgentTool::all()
            .iter()
            .map(|t| t.definition().name)
            .collect();
        assert_eq!(
            names,
            vec!["terminal", "createOrUpdateFiles", "readFile", "listFiles", "executeCode"]
        );
    }

    #[tokio::test]
    async fn test_terminal_appends_stderr() {
        let provider = MockSandboxProvider::new()
            .add_response(MockResponse::success("out").with_stderr("warn"));
        let executor = executor(&provider).await;

        let output = executor
            .execute(&ToolCall::Terminal {
                command: "npm i".to_string(),
            })
            .await;

        assert_eq!(output, "out\nSTDERR: warn");
    }

    #[tokio::test]
    async fn test_write_then_read_files() {
        let provider = MockSandboxProvider::new();
        let executor = executor(&provider).await;

        let written = executor
            .execute(&ToolCall::CreateOrUpdateFiles {
                files: vec![FileSpec::new("/app/a.ts", "a"), FileSpec::new("/app/b.ts", "b")],
            })
            .await;
        assert_eq!(written, "Wrote 2 file(s)");

        let read = executor
            .execute(&ToolCall::ReadFile {
                path: "/app/b.ts".to_string(),
            })
            .await;
        assert_eq!(read, "b");

        let listed = executor
            .execute(&ToolCall::ListFiles {
                path: "/app".to_string(),
            })
            .await;
        assert_eq!(listed, "/app/a.ts\n/app/b.ts");
    }

    #[tokio::test]
    async fn test_failures_become_text() {
        let provider = MockSandboxProvider::new();
        let executor = executor(&provider).await;

        let output = executor
            .execute(&ToolCall::ReadFile {
                path: "/missing".to_string(),
            })
            .await;

        assert!(output.starts_with("Error: "));
    }
}
