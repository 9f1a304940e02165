//! Durable step journal with memoized replay.
//!
//! Every unit of workflow work runs through [`StepJournal::run`] under a
//! stable name. Once a step completes its serialized output is recorded, and
//! running the same name again replays that output instead of repeating the
//! work. Failed steps are never recorded, so a re-run executes them again.
//! With a state directory the journal is written to
//! `<state-dir>/runs/<run-id>.json` after every completed step and can be
//! reloaded to resume a run.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{CoreError, CoreResult};

/// State of a journaled run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalState {
    #[default]
    Running,
    Completed,
    Failed,
}

/// A completed step and its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub output: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// Persistent form of a journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLog {
    pub run_id: String,
    pub state: JournalState,
    /// Completed steps in completion order
    pub steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Error of the last failed execution, if any
    pub error: Option<String>,
}

impl JournalLog {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            state: JournalState::Running,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    fn output(&self, name: &str) -> Option<&serde_json::Value> {
        self.steps.iter().find(|s| s.name == name).map(|s| &s.output)
    }
}

/// Memoizing step runner for one workflow run.
pub struct StepJournal {
    log: Mutex<JournalLog>,
    path: Option<PathBuf>,
}

impl StepJournal {
    /// In-memory journal.
    pub fn new(run_id: impl AsRef<str>) -> Self {
        Self {
            log: Mutex::new(JournalLog::new(run_id.as_ref())),
            path: None,
        }
    }

    /// Journal persisted under `state_dir`, resuming from disk if a log for
    /// `run_id` already exists.
    pub fn persistent(run_id: impl AsRef<str>, state_dir: &Path) -> CoreResult<Self> {
        let path = Self::log_path(state_dir, run_id.as_ref());
        let log = if path.exists() {
            let loaded = Self::load(&path)?;
            debug!(
                "Resuming run {} with {} completed step(s)",
                loaded.run_id,
                loaded.steps.len()
            );
            loaded
        } else {
            JournalLog::new(run_id.as_ref())
        };

        Ok(Self {
            log: Mutex::new(log),
            path: Some(path),
        })
    }

    /// Where a run's journal is stored.
    pub fn log_path(state_dir: &Path, run_id: &str) -> PathBuf {
        state_dir.join("runs").join(format!("{}.json", run_id))
    }

    /// Load a journal log from disk.
    pub fn load(path: &Path) -> CoreResult<JournalLog> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn run_id(&self) -> String {
        self.log.lock().run_id.clone()
    }

    pub fn state(&self) -> JournalState {
        self.log.lock().state
    }

    /// Names of completed steps in completion order.
    pub fn completed_steps(&self) -> Vec<String> {
        self.log.lock().steps.iter().map(|s| s.name.clone()).collect()
    }

    pub fn is_completed(&self, name: &str) -> bool {
        self.log.lock().output(name).is_some()
    }

    /// Copy of the current log.
    pub fn snapshot(&self) -> JournalLog {
        self.log.lock().clone()
    }

    /// Run a named step, or replay its recorded output.
    pub async fn run<T, F, Fut>(&self, name: &str, step: F) -> CoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let recorded = self.log.lock().output(name).cloned();
        if let Some(output) = recorded {
            debug!("Replaying step '{}'", name);
            return Ok(serde_json::from_value(output)?);
        }

        debug!("Running step '{}'", name);
        let value = match step().await {
            Ok(value) => value,
            Err(e) => {
                error!("Step '{}' failed: {}", name, e);
                return Err(e);
            }
        };

        let output = serde_json::to_value(&value)?;
        {
            let mut log = self.log.lock();
            log.steps.push(StepRecord {
                name: name.to_string(),
                output,
                completed_at: Utc::now(),
            });
        }
        self.save()?;
        Ok(value)
    }

    /// Mark the run completed.
    pub fn complete(&self) -> CoreResult<()> {
        {
            let mut log = self.log.lock();
            log.state = JournalState::Completed;
            log.error = None;
            log.completed_at = Some(Utc::now());
        }
        self.save()
    }

    /// Mark the run failed with `message`.
    pub fn fail(&self, message: impl Into<String>) -> CoreResult<()> {
        {
            let mut log = self.log.lock();
            log.state = JournalState::Failed;
            log.error = Some(message.into());
            log.completed_at = Some(Utc::now());
        }
        self.save()
    }

    /// Record an execution error while the run is still being retried.
    pub fn record_error(&self, message: impl Into<String>) -> CoreResult<()> {
        self.log.lock().error = Some(message.into());
        self.save()
    }

    fn save(&self) -> CoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*self.log.lock())?;
        fs::write(path, json)?;
        debug!("Saved step journal to {:?}", path);
        Ok(())
    }
}

/// Coarse retry policy for whole workflow executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Executions in total, including the first
    pub max_attempts: u32,
    /// Delay before the second execution; doubles after that
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay after failed execution number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exponent)
    }
}
