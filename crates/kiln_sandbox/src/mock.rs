//! Mock sandbox provider for testing.
//!
//! Provides configurable mock implementations of the `SandboxProvider` and
//! `Sandbox` traits for use in tests without creating real environments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::{
    CodeOutput, CommandOptions, CommandOutput, CreateOptions, Sandbox, SandboxProvider,
};

/// Predefined mock response for a command execution.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// When set, output is streamed and then the command fails with this message
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl MockResponse {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            error: None,
            duration_ms: 100,
        }
    }

    pub fn failure(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            error: None,
            duration_ms: 100,
        }
    }

    /// A command that fails to complete (timeout, lost connection).
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(message.into()),
            duration_ms: 100,
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_duration(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub sandbox_id: Option<String>,
    pub argument: Option<String>,
}

struct MockState {
    responses: RwLock<Vec<MockResponse>>,
    response_index: AtomicUsize,
    captured_calls: RwLock<Vec<CapturedCall>>,
    sandboxes: RwLock<HashMap<String, Arc<MockSandbox>>>,
    created: AtomicUsize,
    create_failure: RwLock<Option<String>>,
    kill_failure: RwLock<Option<String>>,
    create_delay: RwLock<Duration>,
}

impl MockState {
    fn record_call(&self, method: &str, sandbox_id: Option<&str>, argument: Option<&str>) {
        self.captured_calls.write().push(CapturedCall {
            method: method.to_string(),
            sandbox_id: sandbox_id.map(|s| s.to_string()),
            argument: argument.map(|s| s.to_string()),
        });
    }

    fn next_response(&self) -> MockResponse {
        let responses = self.responses.read();
        if responses.is_empty() {
            return MockResponse::success("");
        }
        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        responses
            .get(index % responses.len())
            .cloned()
            .unwrap_or_else(|| MockResponse::success(""))
    }
}

/// Mock sandbox provider for testing.
///
/// All sandboxes created by one provider share its scripted command
/// responses and its call log, so a test can script a whole workflow
/// up front and verify it afterwards.
#[derive(Clone)]
pub struct MockSandboxProvider {
    state: Arc<MockState>,
}

impl Default for MockSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSandboxProvider {
    /// Create a new mock provider.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                responses: RwLock::new(Vec::new()),
                response_index: AtomicUsize::new(0),
                captured_calls: RwLock::new(Vec::new()),
                sandboxes: RwLock::new(HashMap::new()),
                created: AtomicUsize::new(0),
                create_failure: RwLock::new(None),
                kill_failure: RwLock::new(None),
                create_delay: RwLock::new(Duration::ZERO),
            }),
        }
    }

    /// Add a mock response for the next run_command call.
    pub fn add_response(self, response: MockResponse) -> Self {
        self.state.responses.write().push(response);
        self
    }

    /// Set multiple responses.
    pub fn with_responses(self, responses: Vec<MockResponse>) -> Self {
        *self.state.responses.write() = responses;
        self
    }

    /// Make every create call fail.
    pub fn simulate_create_failure(self, message: impl Into<String>) -> Self {
        *self.state.create_failure.write() = Some(message.into());
        self
    }

    /// Make every kill call fail.
    pub fn simulate_kill_failure(self, message: impl Into<String>) -> Self {
        *self.state.kill_failure.write() = Some(message.into());
        self
    }

    /// Delay each create call, widening the window for races.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.state.create_delay.write() = delay;
        self
    }

    /// Number of sandboxes created so far.
    pub fn created_count(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Number of sandboxes killed so far.
    pub fn killed_count(&self) -> usize {
        self.state
            .sandboxes
            .read()
            .values()
            .filter(|s| s.is_killed())
            .count()
    }

    /// Number of sandboxes still alive.
    pub fn live_count(&self) -> usize {
        self.created_count() - self.killed_count()
    }

    /// Look up a created sandbox.
    pub fn sandbox(&self, sandbox_id: &str) -> Option<Arc<MockSandbox>> {
        self.state.sandboxes.read().get(sandbox_id).cloned()
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.state.captured_calls.read().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.state.captured_calls.read().len()
    }

    /// Check if a specific method was called.
    pub fn was_called(&self, method: &str) -> bool {
        self.state
            .captured_calls
            .read()
            .iter()
            .any(|c| c.method == method)
    }

    /// Get calls to a specific method.
    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.state
            .captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Clear all captured calls.
    pub fn clear_calls(&self) {
        self.state.captured_calls.write().clear();
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn create(&self, options: CreateOptions) -> SandboxResult<Arc<dyn Sandbox>> {
        self.state
            .record_call("create", None, Some(&options.template_id));

        let delay = *self.state.create_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(msg) = self.state.create_failure.read().clone() {
            return Err(SandboxError::CreateFailed(msg));
        }

        let index = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        let sandbox = Arc::new(MockSandbox {
            id: format!("mock-sb-{}", index),
            template_id: options.template_id,
            metadata: options.metadata,
            state: self.state.clone(),
            files: RwLock::new(HashMap::new()),
            killed: AtomicBool::new(false),
        });

        self.state
            .sandboxes
            .write()
            .insert(sandbox.id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn connect(&self, sandbox_id: &str) -> SandboxResult<Arc<dyn Sandbox>> {
        self.state.record_call("connect", Some(sandbox_id), None);
        match self.sandbox(sandbox_id) {
            Some(sandbox) if !sandbox.is_killed() => Ok(sandbox),
            _ => Err(SandboxError::NotFound(sandbox_id.to_string())),
        }
    }
}

/// Mock sandbox with an in-memory filesystem.
pub struct MockSandbox {
    id: String,
    template_id: String,
    metadata: HashMap<String, String>,
    state: Arc<MockState>,
    files: RwLock<HashMap<String, String>>,
    killed: AtomicBool,
}

impl MockSandbox {
    /// Whether kill has succeeded on this sandbox.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Tags attached at creation.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Read a file from the in-memory filesystem.
    pub fn file(&self, path: &str) -> Option<String> {
        self.files.read().get(path).cloned()
    }

    fn ensure_alive(&self) -> SandboxResult<()> {
        if self.is_killed() {
            return Err(SandboxError::Killed(self.id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn template_id(&self) -> &str {
        &self.template_id
    }

    async fn run_command(
        &self,
        command: &str,
        options: CommandOptions,
    ) -> SandboxResult<CommandOutput> {
        self.state
            .record_call("run_command", Some(&self.id), Some(command));
        self.ensure_alive()?;

        let response = self.state.next_response();

        if !response.stdout.is_empty() {
            options.emit_stdout(&response.stdout);
        }
        if !response.stderr.is_empty() {
            options.emit_stderr(&response.stderr);
        }

        if let Some(msg) = response.error {
            return Err(SandboxError::Remote(msg));
        }

        Ok(CommandOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            duration_ms: response.duration_ms,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        self.state.record_call("write_file", Some(&self.id), Some(path));
        self.ensure_alive()?;
        self.files
            .write()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        self.state.record_call("read_file", Some(&self.id), Some(path));
        self.ensure_alive()?;
        self.file(path).ok_or_else(|| {
            SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path),
            ))
        })
    }

    async fn list_files(&self, path: &str) -> SandboxResult<Vec<String>> {
        self.state.record_call("list_files", Some(&self.id), Some(path));
        self.ensure_alive()?;
        let mut files: Vec<String> = self
            .files
            .read()
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        files.sort();
        Ok(files)
    }

    async fn run_code(&self, code: &str) -> SandboxResult<CodeOutput> {
        self.state.record_call("run_code", Some(&self.id), Some(code));
        self.ensure_alive()?;
        Ok(CodeOutput::default())
    }

    fn host(&self, port: u16) -> String {
        format!("{}.sandbox.test:{}", self.id, port)
    }

    async fn kill(&self) -> SandboxResult<()> {
        self.state.record_call("kill", Some(&self.id), None);
        if let Some(msg) = self.state.kill_failure.read().clone() {
            return Err(SandboxError::Remote(msg));
        }
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
