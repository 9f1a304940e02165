//! Runtime settings shared by the `serve` and `run` commands.
//!
//! Every knob can come from a flag or a `KILN_*` environment variable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use kiln_agent::{AgentConfig, HttpAgent, DEFAULT_MODEL};
use kiln_core::{
    FailureClassifier, PatternClassifier, RetryPolicy, ServerLauncher, SessionStore,
    SignatureClassifier, TemplateRegistry, UnknownTemplatePolicy, WorkflowOrchestrator,
    MAX_SELF_HEAL_ATTEMPTS,
};
use kiln_sandbox::LocalSandboxProvider;

#[derive(Args, Debug, Clone)]
pub struct RuntimeArgs {
    /// Directory that holds sandbox working trees
    #[arg(long, env = "KILN_SANDBOX_ROOT", default_value = "/tmp/kiln/sandboxes")]
    pub sandbox_root: PathBuf,

    /// Host used to build preview URLs
    #[arg(long, env = "KILN_PUBLIC_HOST", default_value = "localhost")]
    pub public_host: String,

    /// Seconds a session's sandbox is reused
    #[arg(long, env = "KILN_SESSION_TTL", default_value_t = 600)]
    pub session_ttl: u64,

    /// Seconds a single launch attempt may run
    #[arg(long, env = "KILN_LAUNCH_TIMEOUT", default_value_t = 30)]
    pub launch_timeout: u64,

    /// Launch attempts per run (at most 3)
    #[arg(long, env = "KILN_MAX_ATTEMPTS", default_value_t = MAX_SELF_HEAL_ATTEMPTS)]
    pub max_attempts: u32,

    /// Workflow executions before a run is given up
    #[arg(long, env = "KILN_WORKFLOW_RETRIES", default_value_t = 5)]
    pub workflow_retries: u32,

    /// What to do with unknown template ids: fallback or reject
    #[arg(long, env = "KILN_UNKNOWN_TEMPLATE", default_value = "fallback")]
    pub unknown_template: UnknownTemplatePolicy,

    /// Tool-calling model endpoint
    #[arg(long, env = "KILN_AGENT_ENDPOINT")]
    pub agent_endpoint: String,

    /// Bearer token for the model endpoint
    #[arg(long, env = "KILN_AGENT_API_KEY", hide_env_values = true)]
    pub agent_api_key: Option<String>,

    /// Model identifier
    #[arg(long, env = "KILN_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Persist step journals under this directory
    #[arg(long, env = "KILN_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// YAML file extending the built-in templates
    #[arg(long, env = "KILN_TEMPLATES")]
    pub templates: Option<PathBuf>,

    /// Regex marking a failed launch when found in stdout (repeatable)
    #[arg(long = "stdout-failure", value_name = "REGEX")]
    pub stdout_failure: Vec<String>,

    /// Regex marking a failed launch when found in stderr (repeatable)
    #[arg(long = "stderr-failure", value_name = "REGEX")]
    pub stderr_failure: Vec<String>,
}

/// Load the template catalogue.
pub fn load_templates(path: Option<&PathBuf>) -> Result<TemplateRegistry> {
    match path {
        Some(path) => TemplateRegistry::load_file(path)
            .with_context(|| format!("Failed to load template file {:?}", path)),
        None => Ok(TemplateRegistry::builtin()),
    }
}

impl RuntimeArgs {
    /// Classifier from the configured patterns, or the default signatures.
    pub fn classifier(&self) -> Result<Arc<dyn FailureClassifier>> {
        if self.stdout_failure.is_empty() && self.stderr_failure.is_empty() {
            return Ok(Arc::new(SignatureClassifier));
        }
        let classifier = PatternClassifier::new(&self.stdout_failure, &self.stderr_failure)
            .context("Invalid failure pattern option")?;
        Ok(Arc::new(classifier))
    }

    /// Wire up the sandbox provider, agent and orchestrator.
    pub fn build_orchestrator(&self) -> Result<WorkflowOrchestrator> {
        std::fs::create_dir_all(&self.sandbox_root)
            .with_context(|| format!("Failed to create sandbox root {:?}", self.sandbox_root))?;

        let provider = Arc::new(LocalSandboxProvider::new(
            self.sandbox_root.clone(),
            self.public_host.clone(),
        ));
        let sessions = Arc::new(SessionStore::with_ttl(
            provider,
            Duration::from_secs(self.session_ttl),
        ));

        let mut agent = HttpAgent::new(
            self.agent_endpoint.clone(),
            AgentConfig::new().model(self.model.clone()),
        );
        if let Some(key) = &self.agent_api_key {
            agent = agent.with_api_key(key.clone());
        }

        let launcher = ServerLauncher::new()
            .with_classifier(self.classifier()?)
            .with_timeout(Duration::from_secs(self.launch_timeout));

        let templates = load_templates(self.templates.as_ref())?;

        let mut orchestrator = WorkflowOrchestrator::new(
            sessions,
            Arc::new(agent),
            Arc::new(templates),
            Arc::new(launcher),
        )
        .with_policy(self.unknown_template)
        .with_max_attempts(self.max_attempts)
        .with_retry_policy(RetryPolicy::new(
            self.workflow_retries,
            Duration::from_secs(1),
        ));

        if let Some(dir) = &self.state_dir {
            orchestrator = orchestrator.with_state_dir(dir);
        }

        info!(
            "Runtime ready: sandboxes in {:?}, model {}, unknown templates: {}",
            self.sandbox_root, self.model, self.unknown_template
        );
        Ok(orchestrator)
    }
}
