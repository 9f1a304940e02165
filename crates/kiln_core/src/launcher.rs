//! Server launcher and failure classification.
//!
//! A launch runs the template's start command inside the sandbox, buffers
//! both output streams as they arrive and asks a [`FailureClassifier`]
//! whether the attempt failed. The classifier is consulted on every chunk
//! too, so a launch stops as soon as a failure signature shows up instead of
//! waiting for the command to exit or time out.

use std::sync::Arc;
use std::time::Duration;

use kiln_sandbox::{CommandOptions, Sandbox};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

/// How long a single launch may run (30 seconds).
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of classifying a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

/// Decides whether a launch failed.
///
/// `exit_code` is `None` while the command is still running.
#[cfg_attr(test, mockall::automock)]
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, exit_code: Option<i64>, stdout: &str, stderr: &str) -> Verdict;
}

/// Default classifier: a non-zero exit code, `error` in stderr, or
/// `Failed to compile` in stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureClassifier;

impl FailureClassifier for SignatureClassifier {
    fn classify(&self, exit_code: Option<i64>, stdout: &str, stderr: &str) -> Verdict {
        let failed = exit_code.map_or(false, |code| code != 0)
            || stderr.contains("error")
            || stdout.contains("Failed to compile");

        if failed {
            Verdict::Failure
        } else {
            Verdict::Success
        }
    }
}

/// Regex-driven classifier for build tools with other failure markers.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    stdout: Vec<Regex>,
    stderr: Vec<Regex>,
    check_exit_code: bool,
}

impl PatternClassifier {
    pub fn new(stdout_patterns: &[String], stderr_patterns: &[String]) -> CoreResult<Self> {
        Ok(Self {
            stdout: compile(stdout_patterns)?,
            stderr: compile(stderr_patterns)?,
            check_exit_code: true,
        })
    }

    /// Ignore the exit code and classify on output alone.
    pub fn ignore_exit_code(mut self) -> Self {
        self.check_exit_code = false;
        self
    }
}

fn compile(patterns: &[String]) -> CoreResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| CoreError::InvalidPattern(format!("{}: {}", p, e))))
        .collect()
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, exit_code: Option<i64>, stdout: &str, stderr: &str) -> Verdict {
        let bad_exit = self.check_exit_code && exit_code.map_or(false, |code| code != 0);
        let failed = bad_exit
            || self.stdout.iter().any(|re| re.is_match(stdout))
            || self.stderr.iter().any(|re| re.is_match(stderr));

        if failed {
            Verdict::Failure
        } else {
            Verdict::Success
        }
    }
}

/// Result of one launch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptResult {
    /// 1-based attempt number
    pub attempt_number: u32,
    pub success: bool,
    /// Preview URL, computed whether or not the launch succeeded
    pub preview_url: String,
    /// Failure text; empty on success
    pub error: String,
}

#[derive(Default)]
struct OutputBuffer {
    stdout: Mutex<String>,
    stderr: Mutex<String>,
}

impl OutputBuffer {
    fn snapshot(&self) -> (String, String) {
        (self.stdout.lock().clone(), self.stderr.lock().clone())
    }
}

/// Starts generated projects and classifies the result.
pub struct ServerLauncher {
    classifier: Arc<dyn FailureClassifier>,
    timeout: Duration,
}

impl Default for ServerLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerLauncher {
    pub fn new() -> Self {
        Self {
            classifier: Arc::new(SignatureClassifier),
            timeout: LAUNCH_TIMEOUT,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `command` and report the attempt. Never fails: every problem is
    /// folded into an unsuccessful [`AttemptResult`].
    pub async fn launch(
        &self,
        sandbox: &dyn Sandbox,
        command: &str,
        port: u16,
        attempt: u32,
    ) -> AttemptResult {
        let preview_url = format!("https://{}", sandbox.host(port));
        info!(
            "Launch attempt {} in sandbox {}: {}",
            attempt,
            sandbox.id(),
            command
        );

        let buffer = Arc::new(OutputBuffer::default());
        let failure_seen = Arc::new(Notify::new());

        let options = CommandOptions::new()
            .timeout(self.timeout)
            .on_stdout(self.watcher(buffer.clone(), failure_seen.clone(), true))
            .on_stderr(self.watcher(buffer.clone(), failure_seen.clone(), false));

        let outcome = tokio::select! {
            biased;
            result = sandbox.run_command(command, options) => Some(result),
            _ = failure_seen.notified() => None,
        };

        let (stdout, stderr) = buffer.snapshot();

        let (success, error) = match outcome {
            Some(Ok(output)) => {
                let stdout = if stdout.is_empty() { output.stdout } else { stdout };
                let stderr = if stderr.is_empty() { output.stderr } else { stderr };
                match self
                    .classifier
                    .classify(Some(output.exit_code), &stdout, &stderr)
                {
                    Verdict::Success => (true, String::new()),
                    Verdict::Failure => (false, failure_text(&stdout, &stderr, output.exit_code)),
                }
            }
            Some(Err(e)) => {
                let message = e.to_string();
                let error = if !message.is_empty() {
                    message
                } else if !stderr.is_empty() {
                    stderr
                } else {
                    "launch failed without output".to_string()
                };
                (false, error)
            }
            None => {
                debug!("Failure signature seen before exit, stopping launch");
                let error = if stderr.is_empty() { stdout } else { stderr };
                (false, error)
            }
        };

        if success {
            info!("Launch attempt {} succeeded: {}", attempt, preview_url);
        } else {
            warn!("Launch attempt {} failed: {}", attempt, first_line(&error));
        }

        AttemptResult {
            attempt_number: attempt,
            success,
            preview_url,
            error,
        }
    }

    fn watcher(
        &self,
        buffer: Arc<OutputBuffer>,
        failure_seen: Arc<Notify>,
        is_stdout: bool,
    ) -> kiln_sandbox::OutputHandler {
        let classifier = self.classifier.clone();
        Arc::new(move |chunk: &str| {
            if is_stdout {
                buffer.stdout.lock().push_str(chunk);
            } else {
                buffer.stderr.lock().push_str(chunk);
            }
            let (stdout, stderr) = buffer.snapshot();
            if classifier.classify(None, &stdout, &stderr) == Verdict::Failure {
                failure_seen.notify_one();
            }
        })
    }
}

fn failure_text(stdout: &str, stderr: &str, exit_code: i64) -> String {
    if !stderr.is_empty() {
        stderr.to_string()
    } else if !stdout.is_empty() {
        stdout.to_string()
    } else {
        format!("process exited with code {}", exit_code)
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_sandbox::{CreateOptions, MockResponse, MockSandboxProvider, SandboxProvider};

    async fn launch_with(provider: MockSandboxProvider, launcher: ServerLauncher) -> AttemptResult {
        let sandbox = provider.create(CreateOptions::new("nextjs-developer")).await.unwrap();
        launcher
            .launch(sandbox.as_ref(), "npm run dev -- --port 3000", 3000, 1)
            .await
    }

    #[test]
    fn test_signature_classifier_signals() {
        let c = SignatureClassifier;

        assert_eq!(c.classify(Some(0), "ready", ""), Verdict::Success);
        assert_eq!(c.classify(Some(1), "", ""), Verdict::Failure);
        assert_eq!(c.classify(Some(0), "", "error: module not found"), Verdict::Failure);
        assert_eq!(c.classify(Some(0), "Failed to compile", ""), Verdict::Failure);
        assert_eq!(c.classify(None, "compiling...", "warn: slow"), Verdict::Success);
        // Case-sensitive, like the dev servers' own output.
        assert_eq!(c.classify(Some(0), "", "Error overlay disabled"), Verdict::Success);
    }

    #[test]
    fn test_pattern_classifier() {
        let c = PatternClassifier::new(&["ERR!".to_string()], &[r"(?i)\berror\b".to_string()])
            .unwrap()
            .ignore_exit_code();

        assert_eq!(c.classify(Some(1), "", ""), Verdict::Success);
        assert_eq!(c.classify(Some(0), "npm ERR! missing script", ""), Verdict::Failure);
        assert_eq!(c.classify(Some(0), "", "Error: boom"), Verdict::Failure);
        assert_eq!(c.classify(Some(0), "", "errors=0"), Verdict::Success);

        assert!(matches!(
            PatternClassifier::new(&["(".to_string()], &[]),
            Err(CoreError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn test_successful_launch() {
        let provider = MockSandboxProvider::new()
            .add_response(MockResponse::success("ready - started server on 0.0.0.0:3000"));

        let result = launch_with(provider, ServerLauncher::new()).await;

        assert!(result.success);
        assert!(result.error.is_empty());
        assert_eq!(result.attempt_number, 1);
        assert_eq!(result.preview_url, "https://mock-sb-1.sandbox.test:3000");
    }

    #[tokio::test]
    async fn test_stderr_failure_reports_stderr() {
        let provider = MockSandboxProvider::new()
            .add_response(MockResponse::success("starting").with_stderr("error: module not found"));

        let result = launch_with(provider, ServerLauncher::new()).await;

        assert!(!result.success);
        assert_eq!(result.error, "error: module not found");
        assert_eq!(result.preview_url, "https://mock-sb-1.sandbox.test:3000");
    }

    #[tokio::test]
    async fn test_compile_failure_reports_stdout() {
        let provider = MockSandboxProvider::new()
            .add_response(MockResponse::success("Failed to compile ./pages/index.tsx"));

        let result = launch_with(provider, ServerLauncher::new()).await;

        assert!(!result.success);
        assert_eq!(result.error, "Failed to compile ./pages/index.tsx");
    }

    #[tokio::test]
    async fn test_silent_exit_code_failure() {
        let provider = MockSandboxProvider::new().add_response(MockResponse::failure(127, ""));

        let result = launch_with(provider, ServerLauncher::new()).await;

        assert!(!result.success);
        assert_eq!(result.error, "process exited with code 127");
    }

    #[tokio::test]
    async fn test_thrown_error_uses_message() {
        let provider = MockSandboxProvider::new()
            .add_response(MockResponse::error("connection reset").with_stderr("partial"));

        let result = launch_with(provider, ServerLauncher::new()).await;

        assert!(!result.success);
        assert_eq!(result.error, "connection reset");
    }

    #[tokio::test]
    async fn test_thrown_error_without_message_uses_stderr() {
        let provider = MockSandboxProvider::new()
            .add_response(MockResponse::error("").with_stderr("EADDRINUSE"));

        let result = launch_with(provider, ServerLauncher::new()).await;

        assert!(!result.success);
        assert_eq!(result.error, "EADDRINUSE");
        assert!(!result.preview_url.is_empty());
    }

    #[tokio::test]
    async fn test_custom_classifier_is_consulted() {
        let mut classifier = MockFailureClassifier::new();
        classifier
            .expect_classify()
            .returning(|_, _, _| Verdict::Success);

        let provider = MockSandboxProvider::new()
            .add_response(MockResponse::failure(1, "error: ignored by policy"));

        let result = launch_with(
            provider,
            ServerLauncher::new().with_classifier(Arc::new(classifier)),
        )
        .await;

        assert!(result.success);
    }

    #[tokio::test]
    async fn test_runs_start_command() {
        let provider = MockSandboxProvider::new();
        let sandbox = provider.create(CreateOptions::new("t")).await.unwrap();

        ServerLauncher::new()
            .launch(sandbox.as_ref(), "python app.py", 7860, 2)
            .await;

        let calls = provider.get_method_calls("run_command");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].argument.as_deref(), Some("python app.py"));
    }

    #[tokio::test]
    async fn test_failure_signature_stops_launch_early() {
        let temp = tempfile::TempDir::new().unwrap();
        let provider = kiln_sandbox::LocalSandboxProvider::new(temp.path(), "localhost");
        let sandbox = provider.create(CreateOptions::new("nextjs-developer")).await.unwrap();
        let launcher = ServerLauncher::new().with_timeout(Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let result = launcher
            .launch(sandbox.as_ref(), "echo 'error: x' 1>&2; sleep 10", 3000, 1)
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!result.success);
        assert_eq!(result.error, "error: x\n");
        assert_eq!(result.preview_url, "https://localhost:3000");
    }
}
