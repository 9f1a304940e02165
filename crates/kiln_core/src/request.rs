//! Workflow inputs and the event that carries them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Template used when a request does not name one.
pub const DEFAULT_TEMPLATE: &str = "nextjs-developer";

/// Port a request carries unless told otherwise.
pub const DEFAULT_PORT: u16 = 3000;

fn default_port() -> Option<u16> {
    Some(DEFAULT_PORT)
}

/// A request to generate and run a project.
///
/// Immutable once the workflow starts; every step reads the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    pub session_id: String,
    pub template_id: String,
    /// Port for the dev server; `None` defers to the template's own port
    #[serde(default = "default_port", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl GenerationRequest {
    /// Request with a fresh session id, the default template and port 3000.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: new_session_id(),
            template_id: DEFAULT_TEMPLATE.to_string(),
            port: default_port(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = template_id.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Use the template's port (8501 for streamlit, 7860 for gradio) instead
    /// of a fixed one.
    pub fn with_template_port(mut self) -> Self {
        self.port = None;
        self
    }

    /// Check the request before any step runs.
    pub fn validate(&self) -> CoreResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::InvalidRequest("prompt is required".to_string()));
        }
        if self.session_id.is_empty() {
            return Err(CoreError::InvalidRequest("sessionId must not be empty".to_string()));
        }
        if self.template_id.is_empty() {
            return Err(CoreError::InvalidRequest("templateId must not be empty".to_string()));
        }
        if self.port == Some(0) {
            return Err(CoreError::InvalidRequest("port must be positive".to_string()));
        }
        Ok(())
    }
}

/// Event placed on the bus by the trigger API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEvent {
    pub user_prompt: String,
    pub session_id: String,
    pub template_id: String,
    #[serde(default = "default_port", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl From<GenerateEvent> for GenerationRequest {
    fn from(event: GenerateEvent) -> Self {
        Self {
            prompt: event.user_prompt,
            session_id: event.session_id,
            template_id: event.template_id,
            port: event.port,
        }
    }
}

impl From<GenerationRequest> for GenerateEvent {
    fn from(request: GenerationRequest) -> Self {
        Self {
            user_prompt: request.prompt,
            session_id: request.session_id,
            template_id: request.template_id,
            port: request.port,
        }
    }
}

/// Fresh opaque session identifier.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
