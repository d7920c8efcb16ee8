//! Codex: headless sessions are threads on the shared `codex app-server`,
//! interactive sessions run the TUI.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use uuid::Uuid;

use super::{binary_available, model_args, AgentProvider, ModelInfo, ProviderCapabilities};
use crate::config::{AgentProviderConfig, HeadlessSpawnOptions, InteractiveSpawnOptions};
use crate::error::ProviderError;
use crate::server::{ServerManager, CODEX_BINARY};
use crate::session::{AppServerSession, HeadlessSession, InteractiveCommand, InteractiveSession};

const INSTALL_INSTRUCTIONS: &str =
    "Install the Codex CLI with `npm install -g @openai/codex` (or `brew install codex`), then run `codex login`.";

/// The TUI prints `session id: <uuid>` once the conversation exists.
const SESSION_ID_MARKER: &str =
    r"session id:\s*([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})";

pub struct CodexProvider {
    config: AgentProviderConfig,
    server: Arc<ServerManager>,
}

impl CodexProvider {
    /// A provider whose headless sessions share `server`.
    pub fn new(config: AgentProviderConfig, server: Arc<ServerManager>) -> Self {
        Self { config, server }
    }

    pub fn server(&self) -> &Arc<ServerManager> {
        &self.server
    }

    fn interactive_args(options: &InteractiveSpawnOptions) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(id) = &options.resume_session_id {
            args.push("resume".to_string());
            args.push(id.clone());
        }
        args.extend(model_args(options.model.as_deref()));
        args
    }

    /// Provider config with the per-session timeout taking precedence.
    fn config_for(&self, options: &HeadlessSpawnOptions) -> AgentProviderConfig {
        let mut config = self.config.clone();
        if options.timeout.is_some() {
            config.timeout = options.timeout;
        }
        config
    }

    /// Per-session options a shared app-server cannot apply.
    fn ignored_options(options: &HeadlessSpawnOptions) -> Vec<&'static str> {
        let mut ignored = Vec::new();
        if !options.environment_variables.is_empty() {
            ignored.push("environment_variables");
        }
        if options.root_directory.is_some() {
            ignored.push("root_directory");
        }
        ignored
    }
}

#[async_trait]
impl AgentProvider for CodexProvider {
    fn name(&self) -> &str {
        "codex"
    }

    fn display_name(&self) -> &str {
        "Codex"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            headless: true,
            interactive: true,
            resume: true,
            model_listing: true,
        }
    }

    fn is_available(&self) -> bool {
        binary_available(&self.config, CODEX_BINARY)
    }

    fn install_instructions(&self) -> &str {
        INSTALL_INSTRUCTIONS
    }

    /// Starts a thread on the shared app-server. The server process is
    /// launched once with the provider config, so `environment_variables`
    /// and `root_directory` in `options` are ignored here.
    async fn spawn_headless(
        &self,
        options: HeadlessSpawnOptions,
    ) -> Result<Box<dyn HeadlessSession>, ProviderError> {
        let ignored = Self::ignored_options(&options);
        if !ignored.is_empty() {
            log::debug!(
                "Ignoring {} for Codex thread in {}: the app-server is shared",
                ignored.join(", "),
                options.working_directory
            );
        }
        let lease = self.server.acquire_lease(&self.config_for(&options)).await?;
        let session = AppServerSession::start(lease, &options).await?;
        Ok(Box::new(session))
    }

    fn spawn_interactive(
        &self,
        options: InteractiveSpawnOptions,
    ) -> Result<InteractiveSession, ProviderError> {
        let (session_id, id_marker) = match &options.resume_session_id {
            Some(id) => (id.clone(), None),
            None => {
                let marker = Regex::new(SESSION_ID_MARKER)
                    .map_err(|e| ProviderError::Config(e.to_string()))?;
                (Uuid::new_v4().to_string(), Some(marker))
            }
        };

        let command = InteractiveCommand {
            binary: self.config.executable_or(CODEX_BINARY).to_string(),
            args: Self::interactive_args(&options),
            session_id,
            id_marker,
        };
        InteractiveSession::spawn(command, &self.config, &options)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let lease = self.server.acquire_lease(&self.config).await?;
        let models = lease.client().model_list().await;
        lease.release();
        Ok(models?
            .into_iter()
            .map(|m| ModelInfo::new(m.id, m.display_name, self.name()))
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
