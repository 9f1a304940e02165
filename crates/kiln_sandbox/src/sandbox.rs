//! Sandbox capability traits and types.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SandboxResult;

/// Default lifetime requested for a new sandbox (10 minutes).
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Callback invoked with each chunk of command output as it arrives.
pub type OutputHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for creating a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Template the sandbox is built from
    pub template_id: String,
    /// Free-form tags attached to the sandbox
    pub metadata: HashMap<String, String>,
    /// How long the sandbox stays alive
    pub timeout: Duration,
}

impl CreateOptions {
    pub fn new(template_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            metadata: HashMap::new(),
            timeout: DEFAULT_SANDBOX_TIMEOUT,
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for running a command inside a sandbox.
#[derive(Clone, Default)]
pub struct CommandOptions {
    /// Give up after this long (None = wait for exit)
    pub timeout: Option<Duration>,
    /// Working directory relative to the sandbox root
    pub cwd: Option<String>,
    /// Receives stdout chunks as they arrive
    pub on_stdout: Option<OutputHandler>,
    /// Receives stderr chunks as they arrive
    pub on_stderr: Option<OutputHandler>,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn on_stdout(mut self, handler: OutputHandler) -> Self {
        self.on_stdout = Some(handler);
        self
    }

    pub fn on_stderr(mut self, handler: OutputHandler) -> Self {
        self.on_stderr = Some(handler);
        self
    }

    pub(crate) fn emit_stdout(&self, chunk: &str) {
        if let Some(handler) = &self.on_stdout {
            handler(chunk);
        }
    }

    pub(crate) fn emit_stderr(&self, chunk: &str) {
        if let Some(handler) = &self.on_stderr {
            handler(chunk);
        }
    }
}

impl std::fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandOptions")
            .field("timeout", &self.timeout)
            .field("cwd", &self.cwd)
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code of the process
    pub exit_code: i64,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Check if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Error raised by code executed through [`Sandbox::run_code`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeError {
    pub name: String,
    pub value: String,
    pub traceback: String,
}

/// Result of executing a code snippet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Rich results rendered as text
    pub results: Vec<String>,
    pub error: Option<CodeError>,
}

/// A live sandbox.
///
/// Handles are shared behind `Arc`; every method takes `&self` so a single
/// sandbox can be lent to several callers in turn.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Provider-assigned identifier.
    fn id(&self) -> &str;

    /// Template the sandbox was created from.
    fn template_id(&self) -> &str;

    /// Run a shell command, streaming output to the handlers in `options`.
    ///
    /// A non-zero exit code is not an error. Timeouts and transport
    /// failures are.
    async fn run_command(&self, command: &str, options: CommandOptions)
        -> SandboxResult<CommandOutput>;

    /// Create or overwrite a file.
    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()>;

    /// Read a file as UTF-8 text.
    async fn read_file(&self, path: &str) -> SandboxResult<String>;

    /// List files below a directory.
    async fn list_files(&self, path: &str) -> SandboxResult<Vec<String>>;

    /// Execute a Python snippet.
    async fn run_code(&self, code: &str) -> SandboxResult<CodeOutput>;

    /// Externally reachable host for a port.
    fn host(&self, port: u16) -> String;

    /// Dispose the sandbox and everything running in it.
    async fn kill(&self) -> SandboxResult<()>;
}

/// Creates and reconnects sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create a new sandbox.
    async fn create(&self, options: CreateOptions) -> SandboxResult<Arc<dyn Sandbox>>;

    /// Connect to an existing sandbox by id.
    async fn connect(&self, sandbox_id: &str) -> SandboxResult<Arc<dyn Sandbox>>;
}
