//! Workflow orchestrator.
//!
//! The top-level workflow: resolve the template, acquire the session's
//! sandbox, run the agent once, then for server templates drive the
//! self-heal loop. Every unit of work goes through the run's
//! [`StepJournal`], and [`WorkflowOrchestrator::run`] re-executes the whole
//! workflow against the same journal when an infrastructure step fails.

use std::path::PathBuf;
use std::sync::Arc;

use kiln_agent::{system_prompt, AgentReport, AgentTask, CodingAgent};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::heal::{HealContext, SelfHealController};
use crate::journal::{RetryPolicy, StepJournal};
use crate::launcher::ServerLauncher;
use crate::request::GenerationRequest;
use crate::session::SessionStore;
use crate::template::{TemplateRegistry, UnknownTemplatePolicy};

/// Output of the session acquisition step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub host: String,
}

/// Terminal result of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub session_id: String,
    pub sandbox_id: String,
    pub template_id: String,
    pub success: bool,
    /// Present for server templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// Launch attempts made; absent for templates without a server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Runs generation workflows.
pub struct WorkflowOrchestrator {
    sessions: Arc<SessionStore>,
    agent: Arc<dyn CodingAgent>,
    templates: Arc<TemplateRegistry>,
    healer: SelfHealController,
    policy: UnknownTemplatePolicy,
    retry: RetryPolicy,
    state_dir: Option<PathBuf>,
}

impl WorkflowOrchestrator {
    pub fn new(
        sessions: Arc<SessionStore>,
        agent: Arc<dyn CodingAgent>,
        templates: Arc<TemplateRegistry>,
        launcher: Arc<ServerLauncher>,
    ) -> Self {
        let healer = SelfHealController::new(sessions.clone(), agent.clone(), launcher);
        Self {
            sessions,
            agent,
            templates,
            healer,
            policy: UnknownTemplatePolicy::default(),
            retry: RetryPolicy::default(),
            state_dir: None,
        }
    }

    pub fn with_policy(mut self, policy: UnknownTemplatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.healer = self.healer.with_max_attempts(max_attempts);
        self
    }

    /// Persist step journals under `<dir>/runs/`.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    /// Open the journal for a run id.
    pub fn journal(&self, run_id: &str) -> CoreResult<StepJournal> {
        match &self.state_dir {
            Some(dir) => StepJournal::persistent(run_id, dir),
            None => Ok(StepJournal::new(run_id)),
        }
    }

    /// Run a request to completion under a fresh run id.
    pub async fn run(&self, request: &GenerationRequest) -> CoreResult<WorkflowResult> {
        let journal = self.journal(&Uuid::new_v4().to_string())?;
        self.run_with_journal(request, &journal).await
    }

    /// Execute with the retry policy, reusing `journal` across executions so
    /// completed steps are replayed rather than repeated.
    pub async fn run_with_journal(
        &self,
        request: &GenerationRequest,
        journal: &StepJournal,
    ) -> CoreResult<WorkflowResult> {
        let mut execution = 0;
        loop {
            execution += 1;
            match self.execute(request, journal).await {
                Ok(result) => {
                    journal.complete()?;
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => {
                    journal.fail(e.to_string())?;
                    return Err(e);
                }
                Err(e) if execution >= self.retry.max_attempts => {
                    error!(
                        "Run {} for session {} failed after {} execution(s): {}",
                        journal.run_id(),
                        request.session_id,
                        execution,
                        e
                    );
                    journal.fail(e.to_string())?;
                    return Err(CoreError::RetriesExhausted {
                        attempts: execution,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.retry.backoff(execution);
                    warn!(
                        "Run {} execution {}/{} failed, retrying in {:?}: {}",
                        journal.run_id(),
                        execution,
                        self.retry.max_attempts,
                        delay,
                        e
                    );
                    journal.record_error(e.to_string())?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Execute the workflow once against `journal`.
    pub async fn execute(
        &self,
        request: &GenerationRequest,
        journal: &StepJournal,
    ) -> CoreResult<WorkflowResult> {
        request.validate()?;

        let template = self.templates.resolve(&request.template_id, self.policy)?;
        let port = template.resolve_port(request.port);
        let system = system_prompt(&template.prompt_context(port));
        let session_id = request.session_id.as_str();
        let template_id = request.template_id.as_str();
        let sessions = &self.sessions;
        let agent = &self.agent;

        info!(
            "Workflow for session {} (template {}, port {})",
            session_id, template_id, port
        );

        let sandbox: SandboxInfo = journal
            .run("get-sandbox", move || async move {
                let sandbox = sessions.acquire(session_id, template_id).await?;
                Ok(SandboxInfo {
                    id: sandbox.id().to_string(),
                    host: sandbox.host(port),
                })
            })
            .await?;

        let system_ref = system.as_str();
        let prompt = request.prompt.as_str();
        let report: AgentReport = journal
            .run("agent-generate-code", move || async move {
                let sandbox = sessions.acquire(session_id, template_id).await?;
                Ok(agent.run(sandbox, &AgentTask::new(system_ref, prompt)).await?)
            })
            .await?;
        info!(
            "Generation finished for session {}: {} tool call(s)",
            session_id, report.tool_calls
        );

        if !template.is_interactive() {
            return Ok(WorkflowResult {
                session_id: session_id.to_string(),
                sandbox_id: sandbox.id,
                template_id: template_id.to_string(),
                success: true,
                preview_url: None,
                attempts: None,
                last_error: None,
            });
        }

        let ctx = HealContext {
            session_id: session_id.to_string(),
            template_id: template_id.to_string(),
            command: template.start_command_for(port),
            port,
            system_prompt: system,
        };
        let outcome = self.healer.run(journal, &ctx).await?;
        let last = outcome.last;

        Ok(WorkflowResult {
            session_id: session_id.to_string(),
            sandbox_id: sandbox.id,
            template_id: template_id.to_string(),
            success: last.success,
            preview_url: Some(last.preview_url),
            attempts: Some(outcome.attempts),
            last_error: if last.success { None } else { Some(last.error) },
        })
    }
}
