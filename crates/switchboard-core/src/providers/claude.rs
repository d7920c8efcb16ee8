//! Claude: headless through stream-json, interactive through the TUI.

use async_trait::async_trait;
use uuid::Uuid;

use super::{binary_available, model_args, AgentProvider, ModelInfo, ProviderCapabilities};
use crate::config::{AgentProviderConfig, HeadlessSpawnOptions, InteractiveSpawnOptions};
use crate::error::ProviderError;
use crate::session::{
    ClaudeStreamSession, HeadlessSession, InteractiveCommand, InteractiveSession, CLAUDE_BINARY,
};

const INSTALL_INSTRUCTIONS: &str =
    "Install Claude Code with `npm install -g @anthropic-ai/claude-code`, then run `claude` once to log in.";

/// Model aliases the CLI resolves to the current release of each family.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("default", "Default"),
    ("opus", "Claude Opus"),
    ("sonnet", "Claude Sonnet"),
    ("haiku", "Claude Haiku"),
];

pub struct ClaudeProvider {
    config: AgentProviderConfig,
}

impl ClaudeProvider {
    pub fn new(config: AgentProviderConfig) -> Self {
        Self { config }
    }

    fn interactive_args(options: &InteractiveSpawnOptions, session_id: &str) -> Vec<String> {
        let mut args = model_args(options.model.as_deref());
        if options.resume_session_id.is_some() {
            args.push("--resume".to_string());
        } else {
            args.push("--session-id".to_string());
        }
        args.push(session_id.to_string());
        args
    }
}

#[async_trait]
impl AgentProvider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    fn display_name(&self) -> &str {
        "Claude"
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
        binary_available(&self.config, CLAUDE_BINARY)
    }

    fn install_instructions(&self) -> &str {
        INSTALL_INSTRUCTIONS
    }

    async fn spawn_headless(
        &self,
        options: HeadlessSpawnOptions,
    ) -> Result<Box<dyn HeadlessSession>, ProviderError> {
        let session = ClaudeStreamSession::spawn(&self.config, &options)?;
        Ok(Box::new(session))
    }

    fn spawn_interactive(
        &self,
        options: InteractiveSpawnOptions,
    ) -> Result<InteractiveSession, ProviderError> {
        // Claude accepts a caller-chosen id, so it is known up front.
        let session_id = options
            .resume_session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let command = InteractiveCommand {
            binary: self.config.executable_or(CLAUDE_BINARY).to_string(),
            args: Self::interactive_args(&options, &session_id),
            session_id,
            id_marker: None,
        };
        InteractiveSession::spawn(command, &self.config, &options)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(MODEL_ALIASES
            .iter()
            .map(|(id, name)| ModelInfo::new(*id, *name, self.name()))
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_args_for_new_session() {
        let options = InteractiveSpawnOptions::new("/tmp").model("opus");
        let args = ClaudeProvider::interactive_args(&options, "abc");
        assert_eq!(args, vec!["--model", "opus", "--session-id", "abc"]);
    }

    #[test]
    fn interactive_args_for_resume() {
        let options = InteractiveSpawnOptions::new("/tmp").resume("abc");
        let args = ClaudeProvider::interactive_args(&options, "abc");
        assert_eq!(args, vec!["--resume", "abc"]);
    }

    #[tokio::test]
    async fn lists_static_aliases() {
        let provider = ClaudeProvider::new(AgentProviderConfig::new());
        let models = provider.list_models().await.unwrap();
        assert!(models.iter().any(|m| m.id == "sonnet"));
        assert!(models.iter().all(|m| m.provider == "claude"));
    }

    #[test]
    fn unavailable_with_missing_explicit_path() {
        let provider = ClaudeProvider::new(
            AgentProviderConfig::new().executable_path("/nonexistent/bin/claude"),
        );
        assert!(!provider.is_available());
        assert!(provider.install_instructions().contains("npm install"));
    }

    #[cfg(unix)]
    #[test]
    fn interactive_session_passes_prompt_positionally() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("claude");
        std::fs::write(&script, "#!/bin/sh\nprintf '%s\\n' \"$@\" > \"$0.args\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let provider = ClaudeProvider::new(
            AgentProviderConfig::new()
                .executable_path(script.to_str().unwrap())
                .shell_prefix("/bin/sh -c"),
        );
        let options = InteractiveSpawnOptions::new(dir.path().to_str().unwrap())
            .initial_prompt("fix the `tests`");
        let session = provider.spawn_interactive(options).unwrap();
        while session.events().blocking_recv().is_some() {}

        let args = std::fs::read_to_string(dir.path().join("claude.args")).unwrap();
        let id = session.session_id();
        let lines: Vec<&str> = args.lines().collect();
        assert_eq!(lines, vec!["--session-id", id.as_str(), "fix the `tests`"]);
    }
}
