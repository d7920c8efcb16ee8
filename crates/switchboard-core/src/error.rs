//! Error taxonomy shared by transports, server management, sessions and the
//! provider registry.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the provider/session/transport layer.
///
/// The enum is `Clone` because a single startup failure is handed to every
/// caller coalesced onto the same in-flight server startup.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Transport closed")]
    TransportClosed,

    /// Error object returned by the backend, surfaced verbatim.
    #[error("{message}")]
    Rpc {
        code: Option<i64>,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Failed to spawn {executable} (cwd: {cwd}): {reason}")]
    SpawnFailure {
        executable: String,
        cwd: String,
        reason: String,
    },

    #[error("Timed out after {}ms starting {executable}", .timeout.as_millis())]
    SpawnTimeout {
        executable: String,
        timeout: Duration,
    },

    #[error("Provider '{name}' is not available. {install_instructions}")]
    ProviderUnavailable {
        name: String,
        install_instructions: String,
    },

    #[error("Provider '{name}' is not registered (registered: {})", .registered.join(", "))]
    ProviderNotRegistered {
        name: String,
        registered: Vec<String>,
    },

    #[error("Provider '{provider}' does not support {mode} sessions")]
    Unsupported { provider: String, mode: String },

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Unexpected response: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether this is a spawn timeout, which callers may choose to retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::SpawnTimeout { .. })
    }

    pub(crate) fn spawn_failure(
        executable: impl Into<String>,
        cwd: Option<&str>,
        reason: impl std::fmt::Display,
    ) -> Self {
        ProviderError::SpawnFailure {
            executable: executable.into(),
            cwd: cwd.unwrap_or("<inherited>").to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_displays_backend_message_verbatim() {
        let err = ProviderError::Rpc {
            code: Some(-32000),
            message: "thread not found".to_string(),
            data: None,
        };
        assert_eq!(err.to_string(), "thread not found");
    }

    #[test]
    fn spawn_failure_includes_cwd_and_executable() {
        let err = ProviderError::spawn_failure("codex", Some("/tmp/work"), "No such file");
        let msg = err.to_string();
        assert!(msg.contains("codex"));
        assert!(msg.contains("/tmp/work"));
        assert!(msg.contains("No such file"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_is_distinguishable() {
        let err = ProviderError::SpawnTimeout {
            executable: "codex".to_string(),
            timeout: Duration::from_millis(1500),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn unavailable_embeds_install_instructions() {
        let err = ProviderError::ProviderUnavailable {
            name: "codex".to_string(),
            install_instructions: "Run: npm install -g @openai/codex".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("codex"));
        assert!(msg.contains("npm install -g @openai/codex"));
    }

    #[test]
    fn not_registered_lists_known_providers() {
        let err = ProviderError::ProviderNotRegistered {
            name: "gemini".to_string(),
            registered: vec!["claude".to_string(), "codex".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Provider 'gemini' is not registered (registered: claude, codex)"
        );
    }
}
