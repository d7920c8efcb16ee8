//! OpenCode: interactive only.

use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use uuid::Uuid;

use super::{binary_available, model_args, AgentProvider, ModelInfo, ProviderCapabilities};
use crate::config::{child_environment, AgentProviderConfig, HeadlessSpawnOptions, InteractiveSpawnOptions};
use crate::error::ProviderError;
use crate::session::{HeadlessSession, InteractiveCommand, InteractiveSession};
use crate::shell::build_login_shell_command;

const OPENCODE_BINARY: &str = "opencode";

const INSTALL_INSTRUCTIONS: &str =
    "Install OpenCode with `npm install -g opencode-ai` (or `brew install sst/tap/opencode`).";

const SESSION_ID_MARKER: &str = r"ses_[A-Za-z0-9]+";

pub struct OpenCodeProvider {
    config: AgentProviderConfig,
}

impl OpenCodeProvider {
    pub fn new(config: AgentProviderConfig) -> Self {
        Self { config }
    }

    /// `--prompt` goes last so the positional prompt becomes its value.
    fn interactive_args(options: &InteractiveSpawnOptions) -> Vec<String> {
        let mut args = model_args(options.model.as_deref());
        if let Some(id) = &options.resume_session_id {
            args.push("--session".to_string());
            args.push(id.clone());
        }
        if options.initial_prompt.is_some() {
            args.push("--prompt".to_string());
        }
        args
    }
}

/// Parse `opencode models` output: one `provider/model` per line.
fn parse_models(stdout: &str, provider: &str) -> Vec<ModelInfo> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('/') {
            Some((upstream, model)) => {
                ModelInfo::new(line, format!("{} - {}", upstream, model), provider)
            }
            None => ModelInfo::new(line, line, provider),
        })
        .collect()
}

#[async_trait]
impl AgentProvider for OpenCodeProvider {
    fn name(&self) -> &str {
        "opencode"
    }

    fn display_name(&self) -> &str {
        "OpenCode"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            headless: false,
            interactive: true,
            resume: true,
            model_listing: true,
        }
    }

    fn is_available(&self) -> bool {
        binary_available(&self.config, OPENCODE_BINARY)
    }

    fn install_instructions(&self) -> &str {
        INSTALL_INSTRUCTIONS
    }

    async fn spawn_headless(
        &self,
        _options: HeadlessSpawnOptions,
    ) -> Result<Box<dyn HeadlessSession>, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.name().to_string(),
            mode: "headless".to_string(),
        })
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
            binary: self.config.executable_or(OPENCODE_BINARY).to_string(),
            args: Self::interactive_args(&options),
            session_id,
            id_marker,
        };
        InteractiveSession::spawn(command, &self.config, &options)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let binary = self.config.executable_or(OPENCODE_BINARY);
        let args = vec!["models".to_string()];
        let std_cmd = build_login_shell_command(
            binary,
            &args,
            self.config.working_directory.as_deref(),
            self.config.shell_prefix.as_deref(),
        )?;

        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.envs(child_environment(&self.config, &Default::default(), None))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| ProviderError::spawn_failure(binary, None, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Protocol(format!(
                "opencode models failed: {}",
                stderr.trim()
            )));
        }

        Ok(parse_models(&String::from_utf8_lossy(&output.stdout), self.name()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_args_end_with_prompt_flag() {
        let options = InteractiveSpawnOptions::new("/tmp")
            .model("anthropic/claude-sonnet-4-5")
            .resume("ses_abc")
            .initial_prompt("hi");
        assert_eq!(
            OpenCodeProvider::interactive_args(&options),
            vec!["--model", "anthropic/claude-sonnet-4-5", "--session", "ses_abc", "--prompt"]
        );
        assert!(OpenCodeProvider::interactive_args(&InteractiveSpawnOptions::new("/tmp")).is_empty());
    }

    #[test]
    fn parses_models_output() {
        let models = parse_models("anthropic/claude-sonnet-4-5\n\n  openai/gpt-5  \nlocal\n", "opencode");
        assert_eq!(
            models,
            vec![
                ModelInfo::new("anthropic/claude-sonnet-4-5", "anthropic - claude-sonnet-4-5", "opencode"),
                ModelInfo::new("openai/gpt-5", "openai - gpt-5", "opencode"),
                ModelInfo::new("local", "local", "opencode"),
            ]
        );
    }

    #[tokio::test]
    async fn headless_is_unsupported() {
        let provider = OpenCodeProvider::new(AgentProviderConfig::new());
        let err = match provider.spawn_headless(HeadlessSpawnOptions::new("/tmp")).await {
            Err(err) => err,
            Ok(_) => panic!("opencode has no headless mode"),
        };
        assert!(matches!(err, ProviderError::Unsupported { .. }));
        assert!(!provider.capabilities().headless);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lists_models_from_cli() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("opencode");
        std::fs::write(
            &script,
            "#!/bin/sh\n[ \"$1\" = models ] || exit 1\necho anthropic/claude-sonnet-4-5\necho openai/gpt-5\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let provider = OpenCodeProvider::new(
            AgentProviderConfig::new()
                .executable_path(script.to_str().unwrap())
                .shell_prefix("/bin/sh -c"),
        );
        assert!(provider.is_available());

        let models = provider.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[1].id, "openai/gpt-5");
    }

    #[cfg(unix)]
    #[test]
    fn prompt_becomes_value_of_prompt_flag() {
        use crate::session::PtyEvent;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("opencode");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > \"$0.args\"\necho 'session ses_Q1w2e3'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let provider = OpenCodeProvider::new(
            AgentProviderConfig::new()
                .executable_path(script.to_str().unwrap())
                .shell_prefix("/bin/sh -c"),
        );
        let options = InteractiveSpawnOptions::new(dir.path().to_str().unwrap())
            .initial_prompt("say \"hi\"");
        let session = provider.spawn_interactive(options).unwrap();
        while let Some(event) = session.events().blocking_recv() {
            if matches!(event, PtyEvent::Exit(_)) {
                break;
            }
        }

        let args = std::fs::read_to_string(dir.path().join("opencode.args")).unwrap();
        assert_eq!(args.lines().collect::<Vec<_>>(), vec!["--prompt", "say \"hi\""]);
        assert_eq!(session.session_id(), "ses_Q1w2e3");
    }
}
