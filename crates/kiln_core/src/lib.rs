//! # kiln_core
//!
//! Workflow orchestration and self-healing launch loop for kiln.
//!
//! A generation request provisions (or reuses) a sandbox for its session,
//! lets the coding agent write the project, then starts the project's dev
//! server. Failed launches are fed back to the agent as corrective prompts
//! for a bounded number of attempts.
//!
//! # Architecture
//!
//! - **Templates**: static per-template port, kind and start command
//! - **Session store**: one live sandbox per session, reused within a TTL
//! - **Launcher**: runs the start command and classifies the output
//! - **Self-heal controller**: launch, evaluate, heal, up to three attempts
//! - **Step journal**: memoized, replayable workflow steps plus the coarse
//!   retry policy
//! - **Orchestrator**: the workflow itself
//! - **Dispatcher**: in-process event bus with per-session run status
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kiln_core::{
//!     GenerationRequest, ServerLauncher, SessionStore, TemplateRegistry, WorkflowOrchestrator,
//! };
//!
//! let sessions = Arc::new(SessionStore::new(provider));
//! let orchestrator = WorkflowOrchestrator::new(
//!     sessions,
//!     agent,
//!     Arc::new(TemplateRegistry::builtin()),
//!     Arc::new(ServerLauncher::new()),
//! );
//!
//! let request = GenerationRequest::new("build a todo app").with_port(3000);
//! let result = orchestrator.run(&request).await?;
//! println!("{:?}", result.preview_url);
//! ```

pub mod dispatch;
pub mod error;
pub mod heal;
pub mod journal;
pub mod launcher;
pub mod orchestrator;
pub mod request;
pub mod session;
pub mod template;

// Re-export main types for convenience
pub use dispatch::{
    Dispatcher, RunRecord, RunStatus, RunTracker, DEFAULT_QUEUE_CAPACITY, RUN_RETENTION,
};
pub use error::{CoreError, CoreResult};
pub use heal::{corrective_prompt, HealContext, HealOutcome, HealState, SelfHealController, MAX_SELF_HEAL_ATTEMPTS};
pub use journal::{JournalLog, JournalState, RetryPolicy, StepJournal, StepRecord};
pub use launcher::{
    AttemptResult, FailureClassifier, PatternClassifier, ServerLauncher, SignatureClassifier, Verdict,
    LAUNCH_TIMEOUT,
};
pub use orchestrator::{SandboxInfo, WorkflowOrchestrator, WorkflowResult};
pub use request::{new_session_id, GenerateEvent, GenerationRequest, DEFAULT_PORT, DEFAULT_TEMPLATE};
pub use session::{SessionInfo, SessionStore, SESSION_TTL};
pub use template::{TemplateConfig, TemplateKind, TemplateRegistry, UnknownTemplatePolicy, DEFAULT_START_COMMAND};
