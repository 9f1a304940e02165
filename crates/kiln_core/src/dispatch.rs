//! In-process event bus.
//!
//! The trigger API only enqueues [`GenerateEvent`]s. A single dispatcher
//! task drains the queue and runs each event's workflow on its own task, so
//! independent sessions proceed in parallel. The latest run status per
//! session is kept in a [`RunTracker`] until it has been finished for longer
//! than the retention window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{CoreError, CoreResult};
use crate::orchestrator::{WorkflowOrchestrator, WorkflowResult};
use crate::request::{GenerateEvent, GenerationRequest};

/// Queue depth of the event bus.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// How long a finished run stays queryable (10 minutes).
pub const RUN_RETENTION: Duration = Duration::from_secs(600);

/// Status of the latest run for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed { result: WorkflowResult },
    Failed { error: String },
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Completed { .. } | RunStatus::Failed { .. })
    }
}

/// A status together with when it was recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub session_id: String,
    #[serde(flatten)]
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

/// Latest run status per session.
#[derive(Default)]
pub struct RunTracker {
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session_id: &str, status: RunStatus) {
        debug!("Run for session {} is now {:?}", session_id, status);
        self.runs.write().insert(
            session_id.to_string(),
            RunRecord {
                session_id: session_id.to_string(),
                status,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, session_id: &str) -> Option<RunRecord> {
        self.runs.read().get(session_id).cloned()
    }

    /// Drop finished records last updated more than `retention` ago.
    /// Pending and running records are always kept.
    pub fn evict_finished(&self, retention: Duration) -> usize {
        let retention = match chrono::Duration::from_std(retention) {
            Ok(retention) => retention,
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - retention;

        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|_, record| !(record.status.is_finished() && record.updated_at <= cutoff));
        let evicted = before - runs.len();
        if evicted > 0 {
            debug!("Evicted {} finished run record(s)", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

/// Sending half of the event bus.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<GenerateEvent>,
    tracker: Arc<RunTracker>,
}

impl Dispatcher {
    /// Start the dispatcher task.
    pub fn spawn(orchestrator: Arc<WorkflowOrchestrator>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let tracker = Arc::new(RunTracker::new());
        let handle = tokio::spawn(dispatch_loop(receiver, orchestrator, tracker.clone()));
        (Self { sender, tracker }, handle)
    }

    /// Enqueue an event; its session is marked pending.
    pub async fn submit(&self, event: GenerateEvent) -> CoreResult<()> {
        let session_id = event.session_id.clone();
        self.tracker.set(&session_id, RunStatus::Pending);
        if self.sender.send(event).await.is_err() {
            self.tracker.set(
                &session_id,
                RunStatus::Failed {
                    error: CoreError::DispatcherClosed.to_string(),
                },
            );
            return Err(CoreError::DispatcherClosed);
        }
        Ok(())
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::Receiver<GenerateEvent>,
    orchestrator: Arc<WorkflowOrchestrator>,
    tracker: Arc<RunTracker>,
) {
    info!("Dispatcher started");
    while let Some(event) = receiver.recv().await {
        let orchestrator = orchestrator.clone();
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let request = GenerationRequest::from(event);
            tracker.set(&request.session_id, RunStatus::Running);

            let status = match orchestrator.run(&request).await {
                Ok(result) => {
                    info!(
                        "Run for session {} finished (success={})",
                        request.session_id, result.success
                    );
                    RunStatus::Completed { result }
                }
                Err(e) => {
                    error!("Run for session {} failed: {}", request.session_id, e);
                    RunStatus::Failed {
                        error: e.to_string(),
                    }
                }
            };
            tracker.set(&request.session_id, status);
        });
    }
    info!("Dispatcher stopped");
}
