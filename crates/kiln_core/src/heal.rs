//! Self-heal controller.
//!
//! Drives launch attempts until one succeeds or the attempt ceiling is
//! reached. Between failed attempts the agent is handed the previous error
//! and asked to fix it. Each launch and each heal is its own journal step
//! (`start-server-attempt-{n}`, `self-heal-attempt-{n}`), so a re-executed
//! workflow replays finished attempts instead of repeating them.

use std::sync::Arc;

use kiln_agent::{AgentReport, AgentTask, CodingAgent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::journal::StepJournal;
use crate::launcher::{AttemptResult, ServerLauncher};
use crate::session::SessionStore;

/// Hard ceiling on launch attempts per workflow run.
pub const MAX_SELF_HEAL_ATTEMPTS: u32 = 3;

/// States of the heal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealState {
    Idle,
    Launching,
    Evaluating,
    Healing,
    Succeeded,
    Exhausted,
}

impl HealState {
    /// Next state after evaluating attempt number `attempt`.
    pub fn after_attempt(success: bool, attempt: u32, max_attempts: u32) -> Self {
        if success {
            HealState::Succeeded
        } else if attempt >= max_attempts {
            HealState::Exhausted
        } else {
            HealState::Healing
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HealState::Succeeded | HealState::Exhausted)
    }
}

/// Prompt asking the agent to fix a failed launch.
pub fn corrective_prompt(error: &str) -> String {
    format!(
        "The dev server failed with this error. Please analyze and fix the issue:\n\n{}",
        error
    )
}

/// Everything the loop needs to know about the run it belongs to.
#[derive(Debug, Clone)]
pub struct HealContext {
    pub session_id: String,
    pub template_id: String,
    /// Start command with the port already substituted
    pub command: String,
    pub port: u16,
    /// System prompt handed to the agent for heal passes
    pub system_prompt: String,
}

/// Terminal result of the heal loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealOutcome {
    /// The final attempt
    pub last: AttemptResult,
    /// Attempts made, between 1 and the ceiling
    pub attempts: u32,
    /// Every attempt in order
    pub history: Vec<AttemptResult>,
    /// `Succeeded` or `Exhausted`
    pub state: HealState,
}

/// Launch, evaluate, heal, repeat.
pub struct SelfHealController {
    sessions: Arc<SessionStore>,
    agent: Arc<dyn CodingAgent>,
    launcher: Arc<ServerLauncher>,
    max_attempts: u32,
}

impl SelfHealController {
    pub fn new(
        sessions: Arc<SessionStore>,
        agent: Arc<dyn CodingAgent>,
        launcher: Arc<ServerLauncher>,
    ) -> Self {
        Self {
            sessions,
            agent,
            launcher,
            max_attempts: MAX_SELF_HEAL_ATTEMPTS,
        }
    }

    /// Lower the attempt ceiling. Values above the hard ceiling are clamped.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.clamp(1, MAX_SELF_HEAL_ATTEMPTS);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run the loop to a terminal state.
    ///
    /// Launch failures never escape as errors; only sandbox acquisition and
    /// agent failures do, and those leave the failed step unrecorded.
    pub async fn run(&self, journal: &StepJournal, ctx: &HealContext) -> CoreResult<HealOutcome> {
        let mut state = HealState::Idle;
        let mut attempt = 0;
        let mut history: Vec<AttemptResult> = Vec::new();

        while !state.is_terminal() {
            debug!("Heal loop state {:?} (attempt {})", state, attempt);
            state = match state {
                HealState::Idle => {
                    attempt = 1;
                    HealState::Launching
                }
                HealState::Launching => {
                    history.push(self.launch_step(journal, ctx, attempt).await?);
                    HealState::Evaluating
                }
                HealState::Evaluating => {
                    let success = history.last().map_or(false, |r| r.success);
                    HealState::after_attempt(success, attempt, self.max_attempts)
                }
                HealState::Healing => {
                    let error = history.last().map(|r| r.error.clone()).unwrap_or_default();
                    self.heal_step(journal, ctx, attempt, &error).await?;
                    attempt += 1;
                    HealState::Launching
                }
                HealState::Succeeded | HealState::Exhausted => state,
            };
        }

        let last = history
            .last()
            .cloned()
            .ok_or_else(|| CoreError::InvalidState("heal loop ended without an attempt".to_string()))?;

        match state {
            HealState::Succeeded => info!(
                "Session {} running after {} attempt(s): {}",
                ctx.session_id, attempt, last.preview_url
            ),
            _ => warn!(
                "Session {} still failing after {} attempt(s)",
                ctx.session_id, attempt
            ),
        }

        Ok(HealOutcome {
            last,
            attempts: attempt,
            history,
            state,
        })
    }

    async fn launch_step(
        &self,
        journal: &StepJournal,
        ctx: &HealContext,
        attempt: u32,
    ) -> CoreResult<AttemptResult> {
        let sessions = &self.sessions;
        let launcher = &self.launcher;
        journal
            .run(&format!("start-server-attempt-{}", attempt), move || async move {
                let sandbox = sessions.acquire(&ctx.session_id, &ctx.template_id).await?;
                Ok(launcher
                    .launch(sandbox.as_ref(), &ctx.command, ctx.port, attempt)
                    .await)
            })
            .await
    }

    async fn heal_step(
        &self,
        journal: &StepJournal,
        ctx: &HealContext,
        attempt: u32,
        error: &str,
    ) -> CoreResult<AgentReport> {
        let sessions = &self.sessions;
        let agent = &self.agent;
        journal
            .run(&format!("self-heal-attempt-{}", attempt), move || async move {
                info!("Asking agent to fix attempt {} in session {}", attempt, ctx.session_id);
                let sandbox = sessions.acquire(&ctx.session_id, &ctx.template_id).await?;
                let task = AgentTask::new(&ctx.system_prompt, corrective_prompt(error));
                Ok(agent.run(sandbox, &task).await?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_agent::ScriptedAgent;
    use kiln_sandbox::{MockResponse, MockSandboxProvider};

    fn controller(provider: &MockSandboxProvider, agent: &ScriptedAgent) -> SelfHealController {
        SelfHealController::new(
            Arc::new(SessionStore::new(Arc::new(provider.clone()))),
            Arc::new(agent.clone()),
            Arc::new(ServerLauncher::new()),
        )
    }

    fn context() -> HealContext {
        HealContext {
            session_id: "s1".to_string(),
            template_id: "nextjs-developer".to_string(),
            command: "npm run dev -- --port 3000".to_string(),
            port: 3000,
            system_prompt: "system".to_string(),
        }
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(HealState::after_attempt(true, 1, 3), HealState::Succeeded);
        assert_eq!(HealState::after_attempt(false, 1, 3), HealState::Healing);
        assert_eq!(HealState::after_attempt(false, 2, 3), HealState::Healing);
        assert_eq!(HealState::after_attempt(false, 3, 3), HealState::Exhausted);
        assert_eq!(HealState::after_attempt(true, 3, 3), HealState::Succeeded);
        assert!(HealState::Exhausted.is_terminal());
        assert!(!HealState::Healing.is_terminal());
    }

    #[test]
    fn test_corrective_prompt_embeds_error() {
        assert_eq!(
            corrective_prompt("error: module not found"),
            "The dev server failed with this error. Please analyze and fix the issue:\n\nerror: module not found"
        );
    }

    #[tokio::test]
    async fn test_first_attempt_success_skips_healing() {
        let provider = MockSandboxProvider::new().add_response(MockResponse::success("ready"));
        let agent = ScriptedAgent::new();
        let journal = StepJournal::new("run");

        let outcome = controller(&provider, &agent).run(&journal, &context()).await.unwrap();

        assert_eq!(outcome.state, HealState::Succeeded);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(agent.call_count(), 0);
        assert_eq!(journal.completed_steps(), vec!["start-server-attempt-1".to_string()]);
    }

    #[tokio::test]
    async fn test_heal_between_attempts() {
        let provider = MockSandboxProvider::new().with_responses(vec![
            MockResponse::failure(1, "error: module not found"),
            MockResponse::success("ready"),
        ]);
        let agent = ScriptedAgent::new();
        let journal = StepJournal::new("run");

        let outcome = controller(&provider, &agent).run(&journal, &context()).await.unwrap();

        assert_eq!(outcome.state, HealState::Succeeded);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.history.len(), 2);
        assert!(agent.prompts()[0].contains("error: module not found"));
        assert_eq!(
            journal.completed_steps(),
            vec![
                "start-server-attempt-1".to_string(),
                "self-heal-attempt-1".to_string(),
                "start-server-attempt-2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_last_error() {
        let provider = MockSandboxProvider::new().with_responses(vec![
            MockResponse::failure(1, "error: first"),
            MockResponse::failure(1, "error: second"),
            MockResponse::failure(1, "error: third"),
        ]);
        let agent = ScriptedAgent::new();
        let journal = StepJournal::new("run");

        let outcome = controller(&provider, &agent).run(&journal, &context()).await.unwrap();

        assert_eq!(outcome.state, HealState::Exhausted);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last.error, "error: third");
        assert_eq!(outcome.last.attempt_number, 3);
        // No heal after the final attempt.
        assert_eq!(agent.call_count(), 2);
        assert!(agent.prompts()[1].contains("error: second"));
    }

    #[tokio::test]
    async fn test_lower_ceiling() {
        let provider = MockSandboxProvider::new().add_response(MockResponse::failure(1, "error"));
        let agent = ScriptedAgent::new();
        let journal = StepJournal::new("run");

        let outcome = controller(&provider, &agent)
            .with_max_attempts(1)
            .run(&journal, &context())
            .await
            .unwrap();

        assert_eq!(outcome.state, HealState::Exhausted);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(agent.call_count(), 0);
        assert_eq!(controller(&provider, &agent).with_max_attempts(10).max_attempts(), 3);
    }

    #[tokio::test]
    async fn test_agent_failure_propagates_and_resumes() {
        let provider = MockSandboxProvider::new().with_responses(vec![
            MockResponse::failure(1, "error: broken"),
            MockResponse::success("ready"),
        ]);
        let agent = ScriptedAgent::new().fail_on_call(1, "model unavailable");
        let journal = StepJournal::new("run");
        let controller = controller(&provider, &agent);

        let first = controller.run(&journal, &context()).await;
        assert!(matches!(first, Err(CoreError::Agent(_))));
        assert!(!journal.is_completed("self-heal-attempt-1"));

        let outcome = controller.run(&journal, &context()).await.unwrap();
        assert_eq!(outcome.state, HealState::Succeeded);
        assert_eq!(outcome.attempts, 2);
        // Attempt 1 was replayed, not relaunched.
        assert_eq!(provider.get_method_calls("run_command").len(), 2);
    }
}
