//! Scripted agent for testing.
//!
//! Records every task it receives and optionally replays a fixed list of
//! tool calls against the sandbox, so workflow tests can assert both what
//! the agent was asked and what it changed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_sandbox::Sandbox;
use parking_lot::RwLock;

use crate::agent::{AgentReport, AgentTask, CodingAgent};
use crate::error::{AgentError, AgentResult};
use crate::tools::{ToolCall, ToolExecutor};

/// A task as the scripted agent saw it.
#[derive(Debug, Clone)]
pub struct RecordedTask {
    pub sandbox_id: String,
    pub task: AgentTask,
}

/// Recording test double for [`CodingAgent`].
#[derive(Clone, Default)]
pub struct ScriptedAgent {
    tool_calls: Arc<RwLock<Vec<ToolCall>>>,
    failures: Arc<RwLock<HashMap<usize, String>>>,
    recorded: Arc<RwLock<Vec<RecordedTask>>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tool calls replayed against the sandbox on every run.
    pub fn with_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        *self.tool_calls.write() = calls;
        self
    }

    /// Fail the `n`th run (1-based) with `message`.
    pub fn fail_on_call(self, n: usize, message: impl Into<String>) -> Self {
        self.failures.write().insert(n, message.into());
        self
    }

    /// Number of runs so far, including failed ones.
    pub fn call_count(&self) -> usize {
        self.recorded.read().len()
    }

    /// User prompts in the order they were received.
    pub fn prompts(&self) -> Vec<String> {
        self.recorded
            .read()
            .iter()
            .map(|r| r.task.prompt.clone())
            .collect()
    }

    /// Every recorded task.
    pub fn tasks(&self) -> Vec<RecordedTask> {
        self.recorded.read().clone()
    }
}

#[async_trait]
impl CodingAgent for ScriptedAgent {
    async fn run(&self, sandbox: Arc<dyn Sandbox>, task: &AgentTask) -> AgentResult<AgentReport> {
        let call_number = {
            let mut recorded = self.recorded.write();
            recorded.push(RecordedTask {
                sandbox_id: sandbox.id().to_string(),
                task: task.clone(),
            });
            recorded.len()
        };

        if let Some(message) = self.failures.read().get(&call_number).cloned() {
            return Err(AgentError::Failed(message));
        }

        let calls = self.tool_calls.read().clone();
        let executor = ToolExecutor::new(sandbox);
        for call in &calls {
            executor.execute(call).await;
        }

        Ok(AgentReport {
            iterations: 1,
            tool_calls: calls.len() as u32,
            final_message: Some("done".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FileSpec;
    use kiln_sandbox::{CreateOptions, MockSandboxProvider, SandboxProvider};

    #[tokio::test]
    async fn test_records_prompts_and_applies_calls() {
        let provider = MockSandboxProvider::new();
        let sandbox = provider.create(CreateOptions::new("t")).await.unwrap();
        let agent = ScriptedAgent::new().with_tool_calls(vec![ToolCall::CreateOrUpdateFiles {
            files: vec![FileSpec::new("/app/page.tsx", "export default 1")],
        }]);

        let report = agent
            .run(sandbox.clone(), &AgentTask::new("sys", "build it"))
            .await
            .unwrap();

        assert_eq!(report.tool_calls, 1);
        assert_eq!(agent.prompts(), vec!["build it".to_string()]);
        assert_eq!(
            provider.sandbox(sandbox.id()).unwrap().file("/app/page.tsx"),
            Some("export default 1".to_string())
        );
    }

    #[tokio::test]
    async fn test_fail_on_call() {
        let provider = MockSandboxProvider::new();
        let sandbox = provider.create(CreateOptions::new("t")).await.unwrap();
        let agent = ScriptedAgent::new().fail_on_call(2, "model unavailable");

        assert!(agent.run(sandbox.clone(), &AgentTask::new("s", "a")).await.is_ok());
        let second = agent.run(sandbox.clone(), &AgentTask::new("s", "b")).await;
        assert!(matches!(second, Err(AgentError::Failed(ref m)) if m == "model unavailable"));
        assert!(agent.run(sandbox, &AgentTask::new("s", "c")).await.is_ok());
        assert_eq!(agent.call_count(), 3);
    }
}
