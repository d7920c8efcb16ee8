//! Provider configuration and per-session spawn options.
//!
//! Configuration is plain serde data so an embedding application can keep it
//! in a JSON file next to its other settings:
//!
//! ```json
//! {
//!   "defaultProvider": "codex",
//!   "providers": {
//!     "codex": { "executablePath": "/opt/homebrew/bin/codex", "timeout": 20000 },
//!     "claude": { "providerOptions": { "permissionMode": "acceptEdits" } }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::error::ProviderError;

/// Environment variable that tells a child process where the project root is.
pub const ROOT_DIRECTORY_ENV: &str = "WORKSPACE_ROOT";

/// Spawn timeout used when neither the config nor the options set one.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Static configuration for one provider. Built once and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProviderConfig {
    /// Explicit path to the backend binary; the default name is looked up on PATH otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment_variables: HashMap<String, String>,
    /// Spawn timeout, milliseconds on the wire.
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_directory: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub provider_options: serde_json::Map<String, serde_json::Value>,
    /// Custom login shell prefix (e.g. "/bin/zsh -l -c").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_prefix: Option<String>,
    /// Directory for per-session wire logs. No logs are written when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

impl AgentProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executable_path(mut self, path: impl Into<String>) -> Self {
        self.executable_path = Some(path.into());
        self
    }

    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn root_directory(mut self, dir: impl Into<String>) -> Self {
        self.root_directory = Some(dir.into());
        self
    }

    pub fn provider_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.provider_options.insert(key.into(), value);
        self
    }

    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }

    pub fn log_dir(mut self, dir: impl Into<String>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// The binary to run: the configured path, or the backend's default name.
    pub fn executable_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.executable_path.as_deref().unwrap_or(default)
    }

    /// A string-valued provider option.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.provider_options.get(key).and_then(|v| v.as_str())
    }
}

/// Options for starting a headless (programmatic) session.
#[derive(Debug, Clone, Default)]
pub struct HeadlessSpawnOptions {
    pub working_directory: String,
    pub initial_prompt: Option<String>,
    pub resume_session_id: Option<String>,
    pub model: Option<String>,
    pub environment_variables: HashMap<String, String>,
    pub root_directory: Option<String>,
    pub timeout: Option<Duration>,
}

impl HeadlessSpawnOptions {
    pub fn new(working_directory: impl Into<String>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Self::default()
        }
    }

    pub fn initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    pub fn root_directory(mut self, dir: impl Into<String>) -> Self {
        self.root_directory = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for starting an interactive (PTY) session.
#[derive(Debug, Clone)]
pub struct InteractiveSpawnOptions {
    pub working_directory: String,
    pub initial_prompt: Option<String>,
    pub resume_session_id: Option<String>,
    pub model: Option<String>,
    pub environment_variables: HashMap<String, String>,
    pub root_directory: Option<String>,
    pub timeout: Option<Duration>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for InteractiveSpawnOptions {
    fn default() -> Self {
        Self {
            working_directory: String::new(),
            initial_prompt: None,
            resume_session_id: None,
            model: None,
            environment_variables: HashMap::new(),
            root_directory: None,
            timeout: None,
            cols: 120,
            rows: 40,
        }
    }
}

impl InteractiveSpawnOptions {
    pub fn new(working_directory: impl Into<String>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Self::default()
        }
    }

    pub fn initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    pub fn root_directory(mut self, dir: impl Into<String>) -> Self {
        self.root_directory = Some(dir.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

/// Environment overrides for a child process: config values, then per-session
/// values, then the root-directory marker. The inherited environment is kept by
/// the process builders themselves.
pub(crate) fn child_environment(
    config: &AgentProviderConfig,
    overrides: &HashMap<String, String>,
    root_directory: Option<&str>,
) -> Vec<(String, String)> {
    let mut env: BTreeMap<String, String> = config
        .environment_variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in overrides {
        env.insert(k.clone(), v.clone());
    }
    if let Some(root) = root_directory.or(config.root_directory.as_deref()) {
        env.insert(ROOT_DIRECTORY_ENV.to_string(), root.to_string());
    }
    env.into_iter().collect()
}

/// Resolve the spawn timeout: per-session options win over provider config.
pub(crate) fn effective_timeout(
    options: Option<Duration>,
    config: &AgentProviderConfig,
) -> Duration {
    options.or(config.timeout).unwrap_or(DEFAULT_SPAWN_TIMEOUT)
}

/// Configuration for a whole registry of providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, AgentProviderConfig>,
}

impl ProvidersConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ProviderError> {
        serde_json::from_str(json).map_err(|e| ProviderError::Config(e.to_string()))
    }

    /// Load from a JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProviderError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&contents)
    }

    /// The config for a provider, or an empty config if none was given.
    pub fn provider(&self, name: &str) -> AgentProviderConfig {
        self.providers.get(name).cloned().unwrap_or_default()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
