//! Template catalogue.
//!
//! Templates are static reference data: which port a project listens on,
//! whether it runs as a dev server at all, and how to start it. The
//! built-in table can be extended or overridden from a YAML file:
//!
//! ```yaml
//! templates:
//!   - id: svelte-developer
//!     name: SvelteKit developer
//!     kind: server
//!     port: 5173
//!     start_command: "npm run dev -- --port {port}"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use kiln_agent::PromptContext;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::request::DEFAULT_PORT;

/// Start command used when a template does not name one.
pub const DEFAULT_START_COMMAND: &str = "npm run dev -- --port {port}";

/// How a template's generated project is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// A long-running web server reached through a preview URL
    Server,
    /// Code is executed by the agent itself; nothing to launch
    Interpreter,
}

/// Static configuration for one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub id: String,
    pub name: String,
    pub kind: TemplateKind,
    /// Port the dev server listens on
    #[serde(default)]
    pub port: Option<u16>,
    /// Start command; `{port}` is replaced with the effective port
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub instructions: String,
    /// Main file the agent should write into
    #[serde(default)]
    pub file: Option<String>,
    /// Libraries preinstalled in the sandbox image
    #[serde(default)]
    pub lib: Vec<String>,
}

impl TemplateConfig {
    /// Configuration used for an unrecognised template id.
    pub fn fallback(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: TemplateKind::Server,
            port: None,
            start_command: None,
            instructions: String::new(),
            file: None,
            lib: Vec::new(),
        }
    }

    /// Whether the template runs as a web server.
    pub fn is_interactive(&self) -> bool {
        self.kind == TemplateKind::Server
    }

    /// Effective port: explicit request port, then the template's, then 3000.
    pub fn resolve_port(&self, requested: Option<u16>) -> u16 {
        requested.or(self.port).unwrap_or(DEFAULT_PORT)
    }

    /// Start command with the port substituted.
    pub fn start_command_for(&self, port: u16) -> String {
        self.start_command
            .as_deref()
            .unwrap_or(DEFAULT_START_COMMAND)
            .replace("{port}", &port.to_string())
    }

    /// Context for the agent's system prompt.
    pub fn prompt_context(&self, port: u16) -> PromptContext {
        PromptContext {
            template_id: self.id.clone(),
            name: self.name.clone(),
            instructions: self.instructions.clone(),
            file: self.file.clone(),
            lib: self.lib.clone(),
            port: self.is_interactive().then_some(port),
        }
    }
}

/// What to do with a template id that is not in the catalogue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTemplatePolicy {
    /// Treat it as a server template with the default start command
    #[default]
    Fallback,
    /// Fail before any step runs
    Reject,
}

impl FromStr for UnknownTemplatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fallback" => Ok(Self::Fallback),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "unknown template policy '{}' (expected 'fallback' or 'reject')",
                other
            )),
        }
    }
}

impl std::fmt::Display for UnknownTemplatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fallback => write!(f, "fallback"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    templates: Vec<TemplateConfig>,
}

/// Templates keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, TemplateConfig>,
}

impl TemplateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in templates.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for template in builtin_templates() {
            registry.register(template);
        }
        registry
    }

    /// Built-in templates extended by the entries in a YAML file.
    pub fn load_file(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut registry = Self::builtin();
        registry.merge_yaml(&content)?;
        debug!("Loaded templates from {:?}", path);
        Ok(registry)
    }

    /// Add or replace templates from a YAML document.
    pub fn merge_yaml(&mut self, yaml: &str) -> CoreResult<usize> {
        let file: TemplateFile = serde_yaml::from_str(yaml)?;
        let count = file.templates.len();
        for template in file.templates {
            self.register(template);
        }
        Ok(count)
    }

    /// Add a template, replacing any with the same id.
    pub fn register(&mut self, template: TemplateConfig) {
        debug!("Registering template: {}", template.id);
        self.templates.insert(template.id.clone(), template);
    }

    pub fn get(&self, id: &str) -> Option<&TemplateConfig> {
        self.templates.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    /// All templates ordered by id.
    pub fn list(&self) -> Vec<&TemplateConfig> {
        self.templates.values().collect()
    }

    /// Look up a template, applying `policy` when it is unknown.
    pub fn resolve(&self, id: &str, policy: UnknownTemplatePolicy) -> CoreResult<TemplateConfig> {
        if let Some(template) = self.get(id) {
            return Ok(template.clone());
        }

        match policy {
            UnknownTemplatePolicy::Fallback => {
                warn!("Unknown template '{}', falling back to defaults", id);
                Ok(TemplateConfig::fallback(id))
            }
            UnknownTemplatePolicy::Reject => Err(CoreError::UnknownTemplate(id.to_string())),
        }
    }
}

fn server(
    id: &str,
    name: &str,
    port: u16,
    start_command: &str,
    instructions: &str,
    file: &str,
    lib: &[&str],
) -> TemplateConfig {
    TemplateConfig {
        id: id.to_string(),
        name: name.to_string(),
        kind: TemplateKind::Server,
        port: Some(port),
        start_command: Some(start_command.to_string()),
        instructions: instructions.to_string(),
        file: Some(file.to_string()),
        lib: lib.iter().map(|l| l.to_string()).collect(),
    }
}

fn builtin_templates() -> Vec<TemplateConfig> {
    vec![
        TemplateConfig {
            id: "code-interpreter-v1".to_string(),
            name: "Python data analyst".to_string(),
            kind: TemplateKind::Interpreter,
            port: None,
            start_command: None,
            instructions: "Runs code as a Jupyter notebook cell. Strong data analysis angle. Can use complex visualisation to explain results.".to_string(),
            file: Some("script.py".to_string()),
            lib: ["python", "jupyter", "numpy", "pandas", "matplotlib", "seaborn", "plotly"]
                .iter()
                .map(|l| l.to_string())
                .collect(),
        },
        server(
            "nextjs-developer",
            "Next.js developer",
            3000,
            DEFAULT_START_COMMAND,
            "A Next.js 13+ app that reloads automatically. Using the pages router.",
            "pages/index.tsx",
            &["nextjs@14.2.5", "typescript", "@types/node", "@types/react", "@types/react-dom", "postcss", "tailwindcss", "shadcn"],
        ),
        server(
            "vue-developer",
            "Vue.js developer",
            3000,
            DEFAULT_START_COMMAND,
            "A Vue.js 3+ app that reloads automatically. Only when asked specifically for a Vue app.",
            "app.vue",
            &["vue@latest", "nuxt@3.13.0", "tailwindcss"],
        ),
        server(
            "streamlit-developer",
            "Streamlit developer",
            8501,
            "streamlit run app.py --server.port {port} --server.headless true",
            "A streamlit app that reloads automatically.",
            "app.py",
            &["streamlit", "pandas", "numpy", "matplotlib", "requests", "seaborn", "plotly"],
        ),
        server(
            "gradio-developer",
            "Gradio developer",
            7860,
            "python app.py",
            "A gradio app. Gradio Blocks/Interface should be called demo.",
            "app.py",
            &["gradio", "pandas", "numpy", "matplotlib", "requests", "seaborn", "plotly"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_catalogue() {
        let registry = TemplateRegistry::builtin();

        assert_eq!(registry.list().len(), 5);
        assert!(!registry.get("code-interpreter-v1").unwrap().is_interactive());
        assert_eq!(registry.get("streamlit-developer").unwrap().port, Some(8501));
        assert_eq!(
            registry
                .get("nextjs-developer")
                .unwrap()
                .start_command_for(3000),
            "npm run dev -- --port 3000"
        );
    }

    #[test]
    fn test_port_resolution_order() {
        let registry = TemplateRegistry::builtin();
        let streamlit = registry.get("streamlit-developer").unwrap();

        assert_eq!(streamlit.resolve_port(Some(9000)), 9000);
        assert_eq!(streamlit.resolve_port(None), 8501);
        assert_eq!(TemplateConfig::fallback("x").resolve_port(None), 3000);
    }

    #[test]
    fn test_unknown_template_policies() {
        let registry = TemplateRegistry::builtin();

        let fallback = registry
            .resolve("svelte-developer", UnknownTemplatePolicy::Fallback)
            .unwrap();
        assert!(fallback.is_interactive());
        assert_eq!(fallback.start_command_for(4000), "npm run dev -- --port 4000");

        let rejected = registry.resolve("svelte-developer", UnknownTemplatePolicy::Reject);
        assert!(matches!(rejected, Err(CoreError::UnknownTemplate(ref id)) if id == "svelte-developer"));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("reject".parse::<UnknownTemplatePolicy>(), Ok(UnknownTemplatePolicy::Reject));
        assert_eq!("Fallback".parse::<UnknownTemplatePolicy>(), Ok(UnknownTemplatePolicy::Fallback));
        assert!("strict".parse::<UnknownTemplatePolicy>().is_err());
    }

    #[test]
    fn test_yaml_overrides_and_extends() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("templates.yaml");
        fs::write(
            &path,
            r#"
templates:
  - id: svelte-developer
    name: SvelteKit developer
    kind: server
    port: 5173
  - id: nextjs-developer
    name: Next.js (custom)
    kind: server
    port: 3001
    start_command: "pnpm dev --port {port}"
"#,
        )
        .unwrap();

        let registry = TemplateRegistry::load_file(&path).unwrap();

        assert_eq!(registry.list().len(), 6);
        let svelte = registry.get("svelte-developer").unwrap();
        assert_eq!(svelte.resolve_port(None), 5173);
        assert_eq!(svelte.start_command_for(5173), "npm run dev -- --port 5173");
        assert_eq!(
            registry.get("nextjs-developer").unwrap().start_command_for(3001),
            "pnpm dev --port 3001"
        );
    }

    #[test]
    fn test_prompt_context_omits_port_for_interpreter() {
        let registry = TemplateRegistry::builtin();

        let ctx = registry.get("code-interpreter-v1").unwrap().prompt_context(3000);
        assert_eq!(ctx.port, None);

        let ctx = registry.get("gradio-developer").unwrap().prompt_context(7860);
        assert_eq!(ctx.port, Some(7860));
        assert_eq!(ctx.file.as_deref(), Some("app.py"));
    }
}
