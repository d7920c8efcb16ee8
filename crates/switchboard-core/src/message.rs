//! Unified message type for all agent backends.
//!
//! `AgentMessage` is the only structured type that crosses the provider
//! boundary. The structured fields are a best-effort normalization; the
//! untouched backend payload is always kept in `raw` so callers can reach
//! backend-specific detail when they need it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of an [`AgentMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMessageType {
    System,
    Assistant,
    User,
    ToolUse,
    ToolResult,
    Result,
    Error,
}

/// Tool metadata attached to `tool_use` / `tool_result` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// A message emitted by a headless session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub kind: AgentMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolInfo>,
    /// Untransformed backend payload.
    pub raw: Value,
}

impl AgentMessage {
    pub fn new(kind: AgentMessageType, raw: Value) -> Self {
        Self {
            kind,
            subtype: None,
            session_id: None,
            content: None,
            tool: None,
            raw,
        }
    }

    /// An in-band error. The message text is also kept in `raw`.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            AgentMessageType::Error,
            serde_json::json!({ "type": "error", "message": message }),
        )
        .with_content(message)
    }

    /// Synthesized `system/init` message announcing a session.
    pub fn system_init(session_id: impl Into<String>, raw: Value) -> Self {
        Self::new(AgentMessageType::System, raw)
            .with_subtype("init")
            .with_session_id(session_id)
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_tool(mut self, tool: ToolInfo) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == AgentMessageType::Error
    }
}
