//! Process-backed sandboxes rooted in a local directory.
//!
//! Each sandbox owns a directory under the provider root. Commands run via
//! `sh -c` inside that directory and their output is streamed line by line.
//! There is no kernel-level isolation here; the provider is meant for
//! development machines and single-tenant hosts.
//!
//! Every command gets its own process group. A command that times out, is
//! interrupted, or whose future is dropped takes the whole group down with
//! it, and killing the sandbox also kills groups left running in the
//! background by commands that already returned.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::{
    CodeError, CodeOutput, CommandOptions, CommandOutput, CreateOptions, OutputHandler, Sandbox,
    SandboxProvider,
};

/// Time limit for `run_code` snippets.
pub const DEFAULT_CODE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long output is still collected after `sh` has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Provider that creates [`LocalSandbox`] instances.
pub struct LocalSandboxProvider {
    root: PathBuf,
    public_host: String,
    interpreter: String,
    code_timeout: Duration,
    sandboxes: RwLock<HashMap<String, Arc<LocalSandbox>>>,
}

impl LocalSandboxProvider {
    /// Create a provider storing sandboxes under `root`.
    ///
    /// `public_host` is the hostname preview URLs are built from.
    pub fn new(root: impl Into<PathBuf>, public_host: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_host: public_host.into(),
            interpreter: "python3".to_string(),
            code_timeout: DEFAULT_CODE_TIMEOUT,
            sandboxes: RwLock::new(HashMap::new()),
        }
    }

    /// Program that runs `run_code` snippets (default `python3`).
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Limit for a single `run_code` snippet.
    pub fn with_code_timeout(mut self, timeout: Duration) -> Self {
        self.code_timeout = timeout;
        self
    }

    /// Get the provider root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of sandboxes that have not been killed.
    pub fn live_count(&self) -> usize {
        self.sandboxes
            .read()
            .values()
            .filter(|s| !s.is_killed())
            .count()
    }

    fn generate_sandbox_id() -> String {
        format!("sb-{}", &Uuid::new_v4().simple().to_string()[..12])
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(&self, options: CreateOptions) -> SandboxResult<Arc<dyn Sandbox>> {
        let id = Self::generate_sandbox_id();
        let dir = self.root.join(&id);

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SandboxError::CreateFailed(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let sandbox = Arc::new(LocalSandbox {
            id: id.clone(),
            template_id: options.template_id,
            root: dir,
            public_host: self.public_host.clone(),
            interpreter: self.interpreter.clone(),
            code_timeout: self.code_timeout,
            metadata: options.metadata,
            created_at: Utc::now(),
            expires_at: Instant::now() + options.timeout,
            killed: watch::channel(false).0,
            groups: Arc::new(Mutex::new(HashSet::new())),
        });

        let mut sandboxes = self.sandboxes.write();
        sandboxes.retain(|_, s| !s.is_killed());
        sandboxes.insert(id.clone(), sandbox.clone());

        info!(
            "Created local sandbox {} (template {})",
            id, sandbox.template_id
        );
        Ok(sandbox)
    }

    async fn connect(&self, sandbox_id: &str) -> SandboxResult<Arc<dyn Sandbox>> {
        let sandbox = self
            .sandboxes
            .read()
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;

        if sandbox.is_killed() {
            self.sandboxes.write().remove(sandbox_id);
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        sandbox.ensure_alive()?;

        debug!("Connected to local sandbox {}", sandbox_id);
        Ok(sandbox)
    }
}

/// A sandbox backed by a local directory and `sh`.
pub struct LocalSandbox {
    id: String,
    template_id: String,
    root: PathBuf,
    public_host: String,
    interpreter: String,
    code_timeout: Duration,
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,
    expires_at: Instant,
    killed: watch::Sender<bool>,
    /// Process groups that may still have running members
    groups: Arc<Mutex<HashSet<i32>>>,
}

impl LocalSandbox {
    /// Directory holding the sandbox filesystem.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tags attached at creation.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// When the sandbox was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn is_killed(&self) -> bool {
        *self.killed.borrow()
    }

    fn ensure_alive(&self) -> SandboxResult<()> {
        if self.is_killed() {
            return Err(SandboxError::Killed(self.id.clone()));
        }
        if Instant::now() >= self.expires_at {
            return Err(SandboxError::Expired(self.id.clone()));
        }
        Ok(())
    }

    /// Map a sandbox path onto the host filesystem.
    ///
    /// Absolute paths are taken relative to the sandbox root; `..` is refused.
    fn resolve(&self, path: &str) -> SandboxResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(SandboxError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn kill_groups(&self) {
        let groups: Vec<i32> = self.groups.lock().drain().collect();
        for pgid in groups {
            if kill_group(pgid) {
                debug!("[{}] Killed process group {}", self.id, pgid);
            }
        }
    }
}

impl Drop for LocalSandbox {
    fn drop(&mut self) {
        self.kill_groups();
    }
}

/// SIGKILL every process in the group. Returns false if the group was gone.
#[cfg(unix)]
fn kill_group(pgid: i32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pgid), Signal::SIGKILL).is_ok()
}

#[cfg(unix)]
fn group_alive(pgid: i32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pgid), None).is_ok()
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) -> bool {
    false
}

#[cfg(not(unix))]
fn group_alive(_pgid: i32) -> bool {
    false
}

/// Owns a command's process group until the command has exited.
///
/// Dropping the guard kills the group. [`GroupGuard::release`] hands the
/// group over to the sandbox instead, which kills it on `kill`.
struct GroupGuard {
    pgid: Option<i32>,
    groups: Arc<Mutex<HashSet<i32>>>,
}

impl GroupGuard {
    fn new(pgid: Option<i32>, groups: Arc<Mutex<HashSet<i32>>>) -> Self {
        if let Some(pgid) = pgid {
            groups.lock().insert(pgid);
        }
        Self { pgid, groups }
    }

    fn release(mut self) {
        if let Some(pgid) = self.pgid.take() {
            if !group_alive(pgid) {
                self.groups.lock().remove(&pgid);
            }
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
            self.groups.lock().remove(&pgid);
        }
    }
}

/// Collected output of one stream plus its live handler.
struct StreamSink {
    output: Mutex<String>,
    handler: Option<OutputHandler>,
}

impl StreamSink {
    fn new(handler: Option<OutputHandler>) -> Arc<Self> {
        Arc::new(Self {
            output: Mutex::new(String::new()),
            handler,
        })
    }

    fn take(&self) -> String {
        std::mem::take(&mut *self.output.lock())
    }
}

/// Read a pipe line by line into `sink`.
///
/// Once the command has returned the sink is gone; the pipe is still
/// drained so background writers never block or see a broken pipe.
async fn pump<R: AsyncRead + Unpin>(reader: R, sink: Weak<StreamSink>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let sink = match sink.upgrade() {
            Some(sink) => sink,
            None => continue,
        };
        let chunk = format!("{}\n", line);
        if let Some(handler) = &sink.handler {
            handler(&chunk);
        }
        sink.output.lock().push_str(&chunk);
    }
}

/// Resolve once the sandbox has been killed.
async fn wait_killed(mut killed: watch::Receiver<bool>) {
    loop {
        let is_killed = *killed.borrow_and_update();
        if is_killed {
            return;
        }
        if killed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Split a Python traceback into its exception name and message.
fn parse_python_error(stderr: &str) -> CodeError {
    let last = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();

    let (name, value) = match last.split_once(": ") {
        Some((name, value)) => (name.to_string(), value.to_string()),
        None => ("Error".to_string(), last.to_string()),
    };

    CodeError {
        name,
        value,
        traceback: stderr.to_string(),
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
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
        self.ensure_alive()?;

        let cwd = match &options.cwd {
            Some(dir) => self.resolve(dir)?,
            None => self.root.clone(),
        };

        debug!("[{}] Executing: {}", self.id, command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .env("KILN_SANDBOX_ID", &self.id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::CommandFailed(format!("Failed to spawn sh: {}", e)))?;
        let group = GroupGuard::new(child.id().map(|pid| pid as i32), self.groups.clone());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::CommandFailed("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::CommandFailed("stderr was not captured".to_string()))?;

        let stdout_sink = StreamSink::new(options.on_stdout.clone());
        let stderr_sink = StreamSink::new(options.on_stderr.clone());
        let mut stdout_task = tokio::spawn(pump(stdout, Arc::downgrade(&stdout_sink)));
        let mut stderr_task = tokio::spawn(pump(stderr, Arc::downgrade(&stderr_sink)));

        let started = Instant::now();
        let deadline = options.timeout.map(|limit| started + limit);
        let killed = self.killed.subscribe();
        let id = self.id.clone();

        let wait = async {
            tokio::select! {
                status = child.wait() => status.map_err(SandboxError::from),
                _ = wait_killed(killed) => Err(SandboxError::Killed(id)),
            }
        };

        let status = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!("[{}] Command timed out after {:?}: {}", self.id, limit, command);
                    return Err(SandboxError::Timeout(limit.as_millis() as u64));
                }
            },
            None => wait.await?,
        };

        // Processes sh left in the background may hold the pipes open forever.
        let grace = deadline.map_or(DRAIN_GRACE, |deadline| {
            DRAIN_GRACE.min(deadline.saturating_duration_since(Instant::now()))
        });
        let drained = tokio::time::timeout(grace, async {
            let _ = (&mut stdout_task).await;
            let _ = (&mut stderr_task).await;
        })
        .await;
        if drained.is_err() {
            debug!("[{}] Background processes still hold the output pipes", self.id);
        }
        group.release();

        let stdout = stdout_sink.take();
        let stderr = stderr_sink.take();
        let exit_code = status.code().unwrap_or(-1) as i64;

        debug!(
            "[{}] Command exited with code {} after {:?}",
            self.id,
            exit_code,
            started.elapsed()
        );

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        self.ensure_alive()?;
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        debug!("[{}] Wrote {}", self.id, path);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        self.ensure_alive()?;
        let target = self.resolve(path)?;
        Ok(tokio::fs::read_to_string(&target).await?)
    }

    async fn list_files(&self, path: &str) -> SandboxResult<Vec<String>> {
        self.ensure_alive()?;
        let dir = self.resolve(path)?;
        let root = self.root.clone();

        tokio::task::spawn_blocking(move || {
            let mut files: Vec<String> = WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| {
                    e.path()
                        .strip_prefix(&root)
                        .ok()
                        .map(|p| format!("/{}", p.to_string_lossy()))
                })
                .collect();
            files.sort();
            files
        })
        .await
        .map_err(|e| SandboxError::CommandFailed(format!("listing {} failed: {}", path, e)))
    }

    async fn run_code(&self, code: &str) -> SandboxResult<CodeOutput> {
        let script = format!(".kiln/snippet-{}.py", Uuid::new_v4().simple());
        self.write_file(&script, code).await?;

        let output = self
            .run_command(
                &format!("{} {}", self.interpreter, script),
                CommandOptions::new().timeout(self.code_timeout),
            )
            .await?;

        let error = if output.success() {
            None
        } else {
            Some(parse_python_error(&output.stderr))
        };

        Ok(CodeOutput {
            stdout: output.stdout.lines().map(|l| l.to_string()).collect(),
            stderr: output.stderr.lines().map(|l| l.to_string()).collect(),
            results: Vec::new(),
            error,
        })
    }

    fn host(&self, port: u16) -> String {
        format!("{}:{}", self.public_host, port)
    }

    async fn kill(&self) -> SandboxResult<()> {
        if self.is_killed() {
            return Ok(());
        }
        self.killed.send_replace(true);
        self.kill_groups();

        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!("Killed local sandbox {}", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn create_sandbox(temp: &TempDir) -> (LocalSandboxProvider, Arc<dyn Sandbox>) {
        let provider = LocalSandboxProvider::new(temp.path(), "localhost");
        let sandbox = provider
            .create(CreateOptions::new("nextjs-developer").metadata("sessionId", "s1"))
            .await
            .unwrap();
        (provider, sandbox)
    }

    #[tokio::test]
    async fn test_run_command_captures_streams() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;

        let output = sandbox
            .run_command("echo out; echo err 1>&2; exit 3", CommandOptions::new())
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_run_command_streams_to_handlers() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CommandOptions::new().on_stdout(Arc::new(move |chunk: &str| {
            sink.lock().push(chunk.to_string());
        }));

        sandbox
            .run_command("echo one; echo two", options)
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["one\n".to_string(), "two\n".to_string()]);
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;

        let result = sandbox
            .run_command(
                "sleep 5",
                CommandOptions::new().timeout(Duration::from_millis(100)),
            )
            .await;

        assert!(matches!(result, Err(SandboxError::Timeout(100))));
    }

    #[tokio::test]
    async fn test_background_process_does_not_hold_command() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;

        let started = Instant::now();
        let output = sandbox
            .run_command(
                "sleep 3 & echo started",
                CommandOptions::new().timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(output.stdout, "started\n");
        sandbox.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;
        let marker = temp.path().join("survived");

        let result = sandbox
            .run_command(
                &format!("(sleep 1; touch {}); true", marker.display()),
                CommandOptions::new().timeout(Duration::from_millis(200)),
            )
            .await;
        assert!(matches!(result, Err(SandboxError::Timeout(200))));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_dropped_command_kills_process_group() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;
        let marker = temp.path().join("survived");

        let command = format!("sleep 1; touch {}", marker.display());
        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            sandbox.run_command(&command, CommandOptions::new()),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_kill_stops_background_processes() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;
        let marker = temp.path().join("survived");

        let output = sandbox
            .run_command(
                &format!("(sleep 1; touch {}) >/dev/null 2>&1 &", marker.display()),
                CommandOptions::new(),
            )
            .await
            .unwrap();
        assert!(output.success());

        sandbox.kill().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_run_code_is_time_limited() {
        let temp = TempDir::new().unwrap();
        let provider = LocalSandboxProvider::new(temp.path(), "localhost")
            .with_interpreter("sh")
            .with_code_timeout(Duration::from_millis(200));
        let sandbox = provider
            .create(CreateOptions::new("code-interpreter-v1"))
            .await
            .unwrap();

        let started = Instant::now();
        let result = sandbox.run_code("sleep 5").await;

        assert!(matches!(result, Err(SandboxError::Timeout(200))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_run_code_reports_errors() {
        let temp = TempDir::new().unwrap();
        let provider = LocalSandboxProvider::new(temp.path(), "localhost").with_interpreter("sh");
        let sandbox = provider
            .create(CreateOptions::new("code-interpreter-v1"))
            .await
            .unwrap();

        let output = sandbox
            .run_code("echo hi; echo 'ValueError: bad' 1>&2; exit 1")
            .await
            .unwrap();

        assert_eq!(output.stdout, vec!["hi".to_string()]);
        let error = output.error.unwrap();
        assert_eq!(error.name, "ValueError");
        assert_eq!(error.value, "bad");
    }

    #[tokio::test]
    async fn test_file_round_trip_and_listing() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;

        sandbox
            .write_file("/home/user/app/page.tsx", "export default 1")
            .await
            .unwrap();

        let content = sandbox.read_file("/home/user/app/page.tsx").await.unwrap();
        assert_eq!(content, "export default 1");

        let files = sandbox.list_files("/home/user").await.unwrap();
        assert_eq!(files, vec!["/home/user/app/page.tsx".to_string()]);
    }

    #[tokio::test]
    async fn test_parent_dir_escape_rejected() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;

        let result = sandbox.write_file("../outside.txt", "nope").await;
        assert!(matches!(result, Err(SandboxError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_kill_removes_sandbox() {
        let temp = TempDir::new().unwrap();
        let (provider, sandbox) = create_sandbox(&temp).await;
        let id = sandbox.id().to_string();

        assert_eq!(provider.live_count(), 1);
        assert!(provider.connect(&id).await.is_ok());

        sandbox.kill().await.unwrap();

        assert_eq!(provider.live_count(), 0);
        assert!(!temp.path().join(&id).exists());
        assert!(matches!(
            provider.connect(&id).await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            sandbox.run_command("true", CommandOptions::new()).await,
            Err(SandboxError::Killed(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_sandbox_rejects_work() {
        let temp = TempDir::new().unwrap();
        let provider = LocalSandboxProvider::new(temp.path(), "localhost");
        let sandbox = provider
            .create(CreateOptions::new("nextjs-developer").timeout(Duration::ZERO))
            .await
            .unwrap();

        let result = sandbox.read_file("anything").await;
        assert!(matches!(result, Err(SandboxError::Expired(_))));
    }

    #[tokio::test]
    async fn test_host_uses_public_host() {
        let temp = TempDir::new().unwrap();
        let (_provider, sandbox) = create_sandbox(&temp).await;
        assert_eq!(sandbox.host(3000), "localhost:3000");
    }

    #[test]
    fn test_parse_python_error() {
        let err = parse_python_error(
            "Traceback (most recent call last):\n  File \"x.py\", line 1\nNameError: name 'x' is not defined\n",
        );
        assert_eq!(err.name, "NameError");
        assert_eq!(err.value, "name 'x' is not defined");
        assert!(err.traceback.starts_with("Traceback"));
    }
}
