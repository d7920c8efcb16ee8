//! Agent backends behind one interface.
//!
//! Each provider composes the lower layers for its backend:
//!
//! | Provider | Headless | Interactive | Models |
//! |----------|----------|-------------|--------|
//! | `claude` | own stream-json process | PTY | static aliases |
//! | `codex` | thread on the shared app-server | PTY | `model/list` |
//! | `opencode` | - | PTY | `opencode models` |

mod claude;
mod codex;
mod opencode;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AgentProviderConfig, HeadlessSpawnOptions, InteractiveSpawnOptions};
use crate::error::ProviderError;
use crate::session::{HeadlessSession, InteractiveSession};

pub use claude::ClaudeProvider;
pub use codex::CodexProvider;
pub use opencode::OpenCodeProvider;

/// Which operations a backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    pub headless: bool,
    pub interactive: bool,
    pub resume: bool,
    pub model_listing: bool,
}

/// A model a backend can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    /// Name of the provider that listed it.
    pub provider: String,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, provider: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: provider.to_string(),
        }
    }
}

#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Registry name, e.g. `"claude"`.
    fn name(&self) -> &str;

    /// Human-readable name.
    fn display_name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Whether the backend binary can be found.
    fn is_available(&self) -> bool;

    /// How to install the backend, shown when it is unavailable.
    fn install_instructions(&self) -> &str;

    async fn spawn_headless(
        &self,
        options: HeadlessSpawnOptions,
    ) -> Result<Box<dyn HeadlessSession>, ProviderError>;

    fn spawn_interactive(
        &self,
        options: InteractiveSpawnOptions,
    ) -> Result<InteractiveSession, ProviderError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;
}

/// An explicit executable path must exist; a bare name is looked up on PATH.
pub(crate) fn binary_available(config: &AgentProviderConfig, default_binary: &str) -> bool {
    match &config.executable_path {
        Some(path) if !path.is_empty() => Path::new(path).exists(),
        _ => which::which(default_binary).is_ok(),
    }
}

/// The `--model` pair, if a non-empty model was given.
pub(crate) fn model_args(model: Option<&str>) -> Vec<String> {
    match model {
        Some(model) if !model.is_empty() => vec!["--model".to_string(), model.to_string()],
        _ => Vec::new(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
