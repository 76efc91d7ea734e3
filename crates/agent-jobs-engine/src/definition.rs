//! YAML agent definitions.
//!
//! ```yaml
//! id: echo
//! name: Echo agent
//! backend:
//!   type: echo
//!   delay_ms: 0
//! ```

use std::path::{Component, Path, PathBuf};

use agent_jobs_core::EngineError;
use serde::{Deserialize, Serialize};

/// Ids that would shadow fixed API routes.
const RESERVED_IDS: &[&str] = &["active", "execute", "status", "results", "health"];

/// Backend selection and settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Streams the task back word by word.
    Echo {
        /// Pause between chunks.
        #[serde(default)]
        delay_ms: u64,
        /// Prepended to the final result.
        #[serde(default)]
        prefix: Option<String>,
    },
    /// Runs a process; the task goes to stdin, stdout lines are streamed.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Backend registered by the embedding application under `name`.
    Plugin { name: String },
}

impl BackendConfig {
    /// Short type name for introspection.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Echo { .. } => "echo",
            Self::Command { .. } => "command",
            Self::Plugin { name } => name,
        }
    }
}

/// An agent definition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub backend: BackendConfig,
}

impl AgentDefinition {
    /// Parse and validate a definition.
    ///
    /// # Errors
    /// Returns `EngineError::Definition` on malformed YAML or an unusable id.
    pub fn from_yaml(source: &str) -> Result<Self, EngineError> {
        let def: Self =
            serde_yaml::from_str(source).map_err(|e| EngineError::Definition(e.to_string()))?;
        def.validate()?;
        Ok(def)
    }

    /// Read a definition file.
    ///
    /// # Errors
    /// Returns `EngineError::Definition` if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::Definition(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&source)
    }

    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.id.is_empty() {
            return Err(EngineError::Definition("agent id is empty".into()));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(EngineError::Definition(format!(
                "agent id {:?} may only contain letters, digits, '-', '_' and '.'",
                self.id
            )));
        }
        if RESERVED_IDS.contains(&self.id.as_str()) {
            return Err(EngineError::Definition(format!("agent id {:?} is reserved", self.id)));
        }
        if let BackendConfig::Command { command, .. } = &self.backend {
            if command.trim().is_empty() {
                return Err(EngineError::Definition("command backend needs a command".into()));
            }
        }
        Ok(())
    }
}

/// Resolve a config path against the agents directory.
///
/// Only relative paths that stay inside `root` are accepted.
///
/// # Errors
/// Returns `EngineError::Definition` for empty, absolute or escaping paths.
pub fn resolve_config_path(root: &Path, config_path: &str) -> Result<PathBuf, EngineError> {
    if config_path.trim().is_empty() {
        return Err(EngineError::Definition("configPath is empty".into()));
    }
    let relative = Path::new(config_path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(EngineError::Definition(format!(
            "configPath {config_path:?} must be relative to the agents directory"
        )));
    }
    Ok(root.join(relative))
}
