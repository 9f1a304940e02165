//! Session store.
//!
//! Maps a session id to at most one live sandbox. Entries younger than the
//! TTL are reused; older ones are disposed and replaced. Each session id has
//! its own async lock so concurrent acquisitions for one session serialize on
//! creation while unrelated sessions proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_sandbox::{CreateOptions, Sandbox, SandboxProvider};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CoreResult;

/// How long a session's sandbox is reused (10 minutes).
pub const SESSION_TTL: Duration = Duration::from_secs(10 * 60);

struct SessionEntry {
    sandbox: Arc<dyn Sandbox>,
    template_id: String,
    created_at: Instant,
    created_wall: DateTime<Utc>,
}

impl SessionEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() < ttl
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<SessionEntry>>>;

/// Snapshot of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub sandbox_id: String,
    pub template_id: String,
    pub created_at: DateTime<Utc>,
    /// Seconds until the entry goes stale (0 when already stale)
    pub expires_in_secs: u64,
}

/// Process-wide map from session id to sandbox.
pub struct SessionStore {
    provider: Arc<dyn SandboxProvider>,
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionStore {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self::with_ttl(provider, SESSION_TTL)
    }

    pub fn with_ttl(provider: Arc<dyn SandboxProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slot(&self, session_id: &str) -> Slot {
        self.slots
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Return the session's sandbox, creating or replacing it as needed.
    ///
    /// Creation failures propagate; the session is left without an entry.
    pub async fn acquire(&self, session_id: &str, template_id: &str) -> CoreResult<Arc<dyn Sandbox>> {
        let slot = self.slot(session_id);
        let mut entry = slot.lock().await;

        if let Some(current) = entry.as_ref() {
            if current.is_fresh(self.ttl) {
                debug!(
                    "Reusing sandbox {} for session {}",
                    current.sandbox.id(),
                    session_id
                );
                return Ok(current.sandbox.clone());
            }
        }

        if let Some(stale) = entry.take() {
            info!(
                "Session {} expired, replacing sandbox {}",
                session_id,
                stale.sandbox.id()
            );
            dispose(session_id, stale.sandbox.as_ref()).await;
        }

        let options = CreateOptions::new(template_id)
            .metadata("sessionId", session_id)
            .metadata("template", template_id)
            .timeout(self.ttl);
        let sandbox = self.provider.create(options).await?;

        info!(
            "Created sandbox {} for session {} (template {})",
            sandbox.id(),
            session_id,
            template_id
        );

        *entry = Some(SessionEntry {
            sandbox: sandbox.clone(),
            template_id: template_id.to_string(),
            created_at: Instant::now(),
            created_wall: Utc::now(),
        });
        Ok(sandbox)
    }

    /// Dispose a session's sandbox and drop the entry.
    ///
    /// Returns whether an entry existed. Disposal failures are logged.
    pub async fn destroy(&self, session_id: &str) -> bool {
        let slot = match self.slots.lock().get(session_id) {
            Some(slot) => slot.clone(),
            None => return false,
        };

        let removed = slot.lock().await.take();
        drop(slot);
        self.prune();

        match removed {
            Some(entry) => {
                info!(
                    "Destroying sandbox {} for session {}",
                    entry.sandbox.id(),
                    session_id
                );
                dispose(session_id, entry.sandbox.as_ref()).await;
                true
            }
            None => false,
        }
    }

    /// Dispose every stale entry. Sessions busy acquiring are skipped.
    pub async fn evict_expired(&self) -> usize {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut evicted = 0;
        for (session_id, slot) in slots {
            let stale = match slot.try_lock() {
                Ok(mut entry) => {
                    let expired = entry
                        .as_ref()
                        .map_or(false, |current| !current.is_fresh(self.ttl));
                    if expired {
                        entry.take()
                    } else {
                        None
                    }
                }
                Err(_) => None,
            };

            if let Some(entry) = stale {
                debug!("Evicting sandbox {} for session {}", entry.sandbox.id(), session_id);
                dispose(&session_id, entry.sandbox.as_ref()).await;
                evicted += 1;
            }
        }

        self.prune();
        if evicted > 0 {
            info!("Evicted {} expired session(s)", evicted);
        }
        evicted
    }

    /// Reconnect to a sandbox by its provider id.
    pub async fn get_by_id(&self, sandbox_id: &str) -> CoreResult<Arc<dyn Sandbox>> {
        Ok(self.provider.connect(sandbox_id).await?)
    }

    /// Snapshot of live sessions, ordered by session id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let slots = self.slots.lock();
        let mut sessions: Vec<SessionInfo> = slots
            .iter()
            .filter_map(|(session_id, slot)| {
                let entry = slot.try_lock().ok()?;
                let current = entry.as_ref()?;
                Some(SessionInfo {
                    session_id: session_id.clone(),
                    sandbox_id: current.sandbox.id().to_string(),
                    template_id: current.template_id.clone(),
                    created_at: current.created_wall,
                    expires_in_secs: self
                        .ttl
                        .saturating_sub(current.created_at.elapsed())
                        .as_secs(),
                })
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Number of sessions holding a sandbox.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Drop empty slots nobody else holds. Cloning a slot requires the map
    // lock, so a count of one under that lock cannot change.
    fn prune(&self) {
        self.slots.lock().retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => entry.is_some(),
                Err(_) => true,
            }
        });
    }
}

async fn dispose(session_id: &str, sandbox: &dyn Sandbox) {
    if let Err(e) = sandbox.kill().await {
        warn!(
            "Failed to dispose sandbox {} for session {}: {}",
            sandbox.id(),
            session_id,
            e
        );
    }
}
