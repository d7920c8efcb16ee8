//! Starting the shared app-server process.
//!
//! [`ServerLauncher`] is the seam between [`ServerManager`](super::ServerManager)
//! and the OS. The production launcher runs `codex app-server` in a login
//! shell; tests hand back in-memory streams.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::config::{child_environment, AgentProviderConfig};
use crate::error::ProviderError;
use crate::logging::{open_log_file, LogHandle};
use crate::shell::AgentExit;
use crate::spawn::{spawn_piped, ProcessHandle, SpawnConfig};

/// Default binary name for the Codex CLI.
pub const CODEX_BINARY: &str = "codex";

/// A launched server: its stdio plus a way to kill it and learn of its exit.
pub struct ServerConnection {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub process: ProcessHandle,
    pub exited: oneshot::Receiver<AgentExit>,
    /// Wire log for the transport built on top of this connection.
    pub wire_log: LogHandle,
}

#[async_trait]
pub trait ServerLauncher: Send + Sync {
    /// Start a server process. Failing here fails the pending `acquire()`.
    async fn launch(&self, config: &AgentProviderConfig) -> Result<ServerConnection, ProviderError>;

    /// Executable name used in error messages.
    fn executable(&self, config: &AgentProviderConfig) -> String;
}

/// Runs `codex app-server [-c model="..."]`.
#[derive(Debug, Default, Clone)]
pub struct CodexAppServerLauncher;

impl CodexAppServerLauncher {
    pub fn new() -> Self {
        Self
    }

    fn args(config: &AgentProviderConfig) -> Vec<String> {
        let mut args = vec!["app-server".to_string()];
        if let Some(model) = config.option_str("model") {
            if !model.is_empty() {
                args.push("-c".to_string());
                // JSON string escaping is also a valid TOML basic string.
                args.push(format!("model={}", serde_json::Value::from(model)));
            }
        }
        args
    }
}

#[async_trait]
impl ServerLauncher for CodexAppServerLauncher {
    async fn launch(&self, config: &AgentProviderConfig) -> Result<ServerConnection, ProviderError> {
        let binary = self.executable(config);
        let env = child_environment(config, &HashMap::new(), config.root_directory.as_deref());
        let spawn_config = SpawnConfig::new(&binary, Self::args(config))
            .working_dir(config.working_directory.as_deref())
            .shell_prefix(config.shell_prefix.as_deref())
            .envs(env);

        let wire_log = open_log_file(config.log_dir.as_deref(), "codex-app-server");
        let process = spawn_piped(&spawn_config, wire_log.clone())?;
        log::info!(
            "Started {} app-server (pid {:?})",
            binary,
            process.handle.pid()
        );

        Ok(ServerConnection {
            reader: Box::new(process.stdout),
            writer: Box::new(process.stdin),
            process: process.handle,
            exited: process.exited,
            wire_log,
        })
    }

    fn executable(&self, config: &AgentProviderConfig) -> String {
        config.executable_or(CODEX_BINARY).to_string()
    }
}
