//! Tool-calling agent backed by a remote model endpoint.
//!
//! The endpoint receives the conversation plus tool definitions and answers
//! with either a final message or a list of tool calls. Tool calls are run
//! against the sandbox and their output is appended to the conversation
//! until the model stops asking for tools or the iteration ceiling is hit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_sandbox::Sandbox;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::{AgentConfig, AgentReport, AgentTask, CodingAgent};
use crate::error::{AgentError, AgentResult};
use crate::tools::{ToolCall, ToolDefinition, ToolExecutor};

/// Attempts per model request before giving up.
const MAX_RETRIES: u32 = 3;

/// A conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

/// A tool call as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: &'a [Message],
    tools: &'a [ToolDefinition],
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallRequest>,
}

/// Agent that drives a remote tool-calling model.
pub struct HttpAgent {
    endpoint: String,
    api_key: Option<String>,
    config: AgentConfig,
    client: reqwest::Client,
}

impl HttpAgent {
    /// Create an agent talking to `endpoint`.
    pub fn new(endpoint: impl Into<String>, config: AgentConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Send a bearer token with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = if key.is_empty() { None } else { Some(key) };
        self
    }

    /// Get the configured model.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.config.tools.iter().map(|t| t.definition()).collect()
    }

    /// One model round trip, retrying transient failures.
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> AgentResult<ModelResponse> {
        let request = ModelRequest {
            model: &self.config.model,
            system,
            messages,
            tools,
        };

        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 2s, 4s
                let delay = Duration::from_secs(1 << attempt);
                tokio::time::sleep(delay).await;
            }

            let mut builder = self.client.post(&self.endpoint).json(&request);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }

            let response = match builder.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(AgentError::Http(format!("Network error: {}", e)));
                    continue;
                }
            };

            let status = response.status();

            if status.is_server_error() || status.as_u16() == 429 {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "Model endpoint returned {} (attempt {}/{})",
                    status,
                    attempt + 1,
                    MAX_RETRIES
                );
                last_error = Some(AgentError::Api {
                    status: status.as_u16(),
                    body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(AgentError::Api {
                    status: status.as_u16(),
                    body,
                });
            }

            return response
                .json::<ModelResponse>()
                .await
                .map_err(|e| AgentError::InvalidResponse(e.to_string()));
        }

        Err(last_error.unwrap_or_else(|| AgentError::Http("no attempts made".to_string())))
    }
}

#[async_trait]
impl CodingAgent for HttpAgent {
    async fn run(&self, sandbox: Arc<dyn Sandbox>, task: &AgentTask) -> AgentResult<AgentReport> {
        info!(
            "{} starting in sandbox {} (model {})",
            self.config.name,
            sandbox.id(),
            self.config.model
        );

        let executor =
            ToolExecutor::new(sandbox.clone()).with_command_timeout(self.config.command_timeout);
        let tools = self.tool_definitions();
        let mut messages = vec![Message::user(&task.prompt)];
        let mut report = AgentReport::default();

        while report.iterations < self.config.max_iterations {
            report.iterations += 1;

            let response = self
                .complete(&task.system_prompt, &messages, &tools)
                .await?;

            if response.tool_calls.is_empty() {
                report.final_message = response.content;
                break;
            }

            messages.push(Message {
                role: MessageRole::Assistant,
                content: response.content.unwrap_or_default(),
                tool_calls: response.tool_calls.clone(),
                tool_call_id: None,
            });

            for request in response.tool_calls {
                let output = match ToolCall::from_parts(&request.name, request.arguments) {
                    Ok(call) => {
                        report.tool_calls += 1;
                        executor.execute(&call).await
                    }
                    Err(e) => format!("Error: {}", e),
                };
                debug!("Tool {} returned {} bytes", request.name, output.len());
                messages.push(Message::tool_result(request.id, output));
            }
        }

        if report.final_message.is_none() && report.iterations >= self.config.max_iterations {
            warn!(
                "{} stopped after {} iterations in sandbox {}",
                self.config.name,
                report.iterations,
                sandbox.id()
            );
        }

        info!(
            "{} finished in sandbox {}: {} iteration(s), {} tool call(s)",
            self.config.name,
            sandbox.id(),
            report.iterations,
            report.tool_calls
        );
        Ok(report)
    }
}
