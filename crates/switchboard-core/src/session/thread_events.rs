//! App-server notifications → [`AgentMessage`]s for one thread.
//!
//! Every session sharing the server sees every notification, so the mapper
//! first checks that a notification belongs to its thread. Notifications that
//! name another thread, or no thread at all, produce nothing.
//!
//! | notification                         | message                          |
//! |--------------------------------------|----------------------------------|
//! | `item/agentMessage/delta`            | buffered                         |
//! | `item/completed` (agentMessage)      | `assistant` with the full text   |
//! | `item/started` (tool-like item)      | `tool_use`                       |
//! | `item/completed` (tool-like item)    | `tool_result`                    |
//! | `turn/completed`                     | `result` (`success` or `error`)  |
//! | `error`                              | `error`                          |
//!
//! `raw` on every message is the notification as received. Text flushed
//! without an `item/completed` carries the buffered deltas as a JSON array.

use serde_json::{json, Value};

use crate::message::{AgentMessage, AgentMessageType, ToolInfo};
use crate::rpc::RpcNotification;

/// Stateful mapper for one thread: buffered text and the active turn.
#[derive(Debug)]
pub struct ThreadEventMapper {
    thread_id: String,
    buffer: String,
    /// Delta notifications behind `buffer`, kept for `raw`.
    deltas: Vec<Value>,
    active_turn: Option<String>,
    last_completed_turn: Option<String>,
}

impl ThreadEventMapper {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            buffer: String::new(),
            deltas: Vec::new(),
            active_turn: None,
            last_completed_turn: None,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// The turn currently running, if any.
    pub fn active_turn(&self) -> Option<&str> {
        self.active_turn.as_deref()
    }

    /// Record a turn id learned from a `turn/start` response. Ignored when
    /// that turn has already completed.
    pub fn note_turn_started(&mut self, turn_id: &str) {
        if self.last_completed_turn.as_deref() != Some(turn_id) {
            self.active_turn = Some(turn_id.to_string());
        }
    }

    /// Emit any buffered assistant text as a final message.
    pub fn flush(&mut self) -> Option<AgentMessage> {
        if self.buffer.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.buffer);
        let raw = Value::Array(std::mem::take(&mut self.deltas));
        Some(self.message(AgentMessageType::Assistant, raw).with_content(text))
    }

    pub fn map(&mut self, notification: &RpcNotification) -> Vec<AgentMessage> {
        let empty = Value::Null;
        let params = notification.params.as_ref().unwrap_or(&empty);
        if notification_thread(params) != Some(self.thread_id.as_str()) {
            return Vec::new();
        }

        let raw = json!({ "method": notification.method, "params": params });

        match notification.method.as_str() {
            "turn/started" => {
                if let Some(turn_id) = params.pointer("/turn/id").and_then(Value::as_str) {
                    self.active_turn = Some(turn_id.to_string());
                }
                Vec::new()
            }

            "item/agentMessage/delta" => {
                if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                    self.buffer.push_str(delta);
                    self.deltas.push(raw);
                }
                Vec::new()
            }

            "item/started" => {
                let Some(item) = params.get("item") else {
                    return Vec::new();
                };
                match tool_info(item) {
                    Some(tool) => vec![self.message(AgentMessageType::ToolUse, raw).with_tool(tool)],
                    None => Vec::new(),
                }
            }

            "item/completed" => {
                let Some(item) = params.get("item") else {
                    return Vec::new();
                };
                if item_type(item) == Some("agentMessage") {
                    let buffered = std::mem::take(&mut self.buffer);
                    self.deltas.clear();
                    let text = item
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .unwrap_or(buffered);
                    if text.is_empty() {
                        return Vec::new();
                    }
                    return vec![self.message(AgentMessageType::Assistant, raw).with_content(text)];
                }

                match tool_info(item) {
                    Some(tool) => {
                        let mut message = self.message(AgentMessageType::ToolResult, raw).with_tool(tool);
                        if let Some(output) = item_output(item) {
                            message = message.with_content(output);
                        }
                        vec![message]
                    }
                    None => Vec::new(),
                }
            }

            "turn/completed" => {
                let mut messages: Vec<AgentMessage> = self.flush().into_iter().collect();
                let turn = params.get("turn");
                if let Some(turn_id) = turn.and_then(|t| t.get("id")).and_then(Value::as_str) {
                    self.last_completed_turn = Some(turn_id.to_string());
                }
                self.active_turn = None;

                let failed = turn
                    .and_then(|t| t.get("status"))
                    .and_then(Value::as_str)
                    .map(|s| s == "failed")
                    .unwrap_or(false);
                let result = if failed {
                    let reason = turn
                        .and_then(|t| t.pointer("/error/message"))
                        .and_then(Value::as_str)
                        .unwrap_or("Turn failed");
                    self.message(AgentMessageType::Result, raw)
                        .with_subtype("error")
                        .with_content(reason)
                } else {
                    self.message(AgentMessageType::Result, raw).with_subtype("success")
                };
                messages.push(result);
                messages
            }

            "error" => {
                let text = params
                    .pointer("/error/message")
                    .or_else(|| params.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                vec![self.message(AgentMessageType::Error, raw).with_content(text)]
            }

            _ => Vec::new(),
        }
    }

    fn message(&self, kind: AgentMessageType, raw: Value) -> AgentMessage {
        AgentMessage::new(kind, raw).with_session_id(&self.thread_id)
    }
}

/// Thread a notification belongs to, wherever the server put it.
fn notification_thread(params: &Value) -> Option<&str> {
    params
        .get("threadId")
        .or_else(|| params.pointer("/thread/id"))
        .or_else(|| params.pointer("/turn/threadId"))
        .and_then(Value::as_str)
}

fn item_type(item: &Value) -> Option<&str> {
    item.get("type").and_then(Value::as_str)
}

fn tool_info(item: &Value) -> Option<ToolInfo> {
    let id = item.get("id").and_then(Value::as_str).map(str::to_string);
    let (name, input) = match item_type(item)? {
        "commandExecution" => (
            "Bash".to_string(),
            json!({ "command": item.get("command").cloned().unwrap_or(Value::Null) }),
        ),
        "fileChange" => (
            "Edit".to_string(),
            item.get("changes")
                .cloned()
                .map(|changes| json!({ "changes": changes }))
                .unwrap_or_else(|| {
                    json!({
                        "file_path": item.get("filePath").cloned().unwrap_or(Value::Null),
                        "diff": item.get("diff").cloned().unwrap_or(Value::Null),
                    })
                }),
        ),
        "mcpToolCall" => (
            item.get("tool")
                .or_else(|| item.get("toolName"))
                .and_then(Value::as_str)
                .unwrap_or("Tool")
                .to_string(),
            item.get("arguments").cloned().unwrap_or(Value::Null),
        ),
        _ => return None,
    };
    Some(ToolInfo {
        name: Some(name),
        id,
        input: Some(input),
    })
}

fn item_output(item: &Value) -> Option<String> {
    if let Some(output) = item.get("aggregatedOutput").and_then(Value::as_str) {
        return Some(output.to_string());
    }
    match item.get("result") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => item.get("status").and_then(Value::as_str).map(str::to_string),
        Some(other) => Some(other.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn n(method: &str, params: Value) -> RpcNotification {
        RpcNotification {
            method: method.to_string(),
            params: Some(params),
        }
    }

    #[test]
    fn deltas_are_buffered_until_item_completes() {
        let mut mapper = ThreadEventMapper::new("t1");
        assert!(mapper
            .map(&n("item/agentMessage/delta", json!({"threadId": "t1", "delta": "Hel"})))
            .is_empty());
        assert!(mapper
            .map(&n("item/agentMessage/delta", json!({"threadId": "t1", "delta": "lo"})))
            .is_empty());

        let out = mapper.map(&n(
            "item/completed",
            json!({"threadId": "t1", "item": {"type": "agentMessage", "id": "i1"}}),
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, AgentMessageType::Assistant);
        assert_eq!(out[0].content.as_deref(), Some("Hello"));
        assert_eq!(out[0].session_id.as_deref(), Some("t1"));
        assert_eq!(out[0].raw["method"], "item/completed");
        assert!(mapper.flush().is_none());
    }

    #[test]
    fn flushed_text_keeps_the_delta_notifications() {
        let mut mapper = ThreadEventMapper::new("t1");
        mapper.map(&n("item/agentMessage/delta", json!({"threadId": "t1", "delta": "half "})));
        mapper.map(&n("item/agentMessage/delta", json!({"threadId": "t1", "delta": "done"})));

        let flushed = mapper.flush().unwrap();
        assert_eq!(flushed.content.as_deref(), Some("half done"));
        assert_eq!(
            flushed.raw,
            json!([
                {"method": "item/agentMessage/delta", "params": {"threadId": "t1", "delta": "half "}},
                {"method": "item/agentMessage/delta", "params": {"threadId": "t1", "delta": "done"}},
            ])
        );
        assert!(mapper.flush().is_none());

        // A completed item consumes the deltas too.
        mapper.map(&n("item/agentMessage/delta", json!({"threadId": "t1", "delta": "x"})));
        mapper.map(&n("item/completed", json!({"threadId": "t1", "item": {"type": "agentMessage"}})));
        mapper.map(&n("item/agentMessage/delta", json!({"threadId": "t1", "delta": "y"})));
        assert_eq!(mapper.flush().unwrap().raw.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn completed_item_text_wins_over_buffer() {
        let mut mapper = ThreadEventMapper::new("t1");
        mapper.map(&n("item/agentMessage/delta", json!({"threadId": "t1", "delta": "partial"})));
        let out = mapper.map(&n(
            "item/completed",
            json!({"threadId": "t1", "item": {"type": "agentMessage", "text": "Full answer"}}),
        ));
        assert_eq!(out[0].content.as_deref(), Some("Full answer"));
    }

    #[test]
    fn other_threads_and_unattributed_notifications_are_ignored() {
        let mut mapper = ThreadEventMapper::new("t1");
        assert!(mapper
            .map(&n("error", json!({"threadId": "t2", "message": "not mine"})))
            .is_empty());
        assert!(mapper.map(&n("error", json!({"message": "no thread"}))).is_empty());
        mapper.map(&n("item/agentMessage/delta", json!({"threadId": "t2", "delta": "x"})));
        assert!(mapper.flush().is_none());
    }

    #[test]
    fn command_execution_maps_to_tool_use_and_result() {
        let mut mapper = ThreadEventMapper::new("t1");
        let started = mapper.map(&n(
            "item/started",
            json!({"threadId": "t1", "item": {"type": "commandExecution", "id": "c1", "command": "ls"}}),
        ));
        assert_eq!(started[0].kind, AgentMessageType::ToolUse);
        let tool = started[0].tool.as_ref().unwrap();
        assert_eq!(tool.name.as_deref(), Some("Bash"));
        assert_eq!(tool.id.as_deref(), Some("c1"));
        assert_eq!(tool.input, Some(json!({"command": "ls"})));

        let completed = mapper.map(&n(
            "item/completed",
            json!({"threadId": "t1", "item": {"type": "commandExecution", "id": "c1", "command": "ls", "aggregatedOutput": "a.txt\n"}}),
        ));
        assert_eq!(completed[0].kind, AgentMessageType::ToolResult);
        assert_eq!(completed[0].content.as_deref(), Some("a.txt\n"));
    }

    #[test]
    fn mcp_tool_call_uses_tool_name() {
        let mut mapper = ThreadEventMapper::new("t1");
        let out = mapper.map(&n(
            "item/started",
            json!({"threadId": "t1", "item": {"type": "mcpToolCall", "tool": "search", "arguments": {"q": "x"}}}),
        ));
        let tool = out[0].tool.as_ref().unwrap();
        assert_eq!(tool.name.as_deref(), Some("search"));
        assert_eq!(tool.input, Some(json!({"q": "x"})));
    }

    #[test]
    fn reasoning_items_produce_nothing() {
        let mut mapper = ThreadEventMapper::new("t1");
        assert!(mapper
            .map(&n("item/started", json!({"threadId": "t1", "item": {"type": "reasoning"}})))
            .is_empty());
    }

    #[test]
    fn turn_completed_flushes_then_reports_result() {
        let mut mapper = ThreadEventMapper::new("t1");
        mapper.map(&n("turn/started", json!({"threadId": "t1", "turn": {"id": "turn-1"}})));
        assert_eq!(mapper.active_turn(), Some("turn-1"));
        mapper.map(&n("item/agentMessage/delta", json!({"threadId": "t1", "delta": "tail"})));

        let out = mapper.map(&n(
            "turn/completed",
            json!({"threadId": "t1", "turn": {"id": "turn-1", "status": "completed"}}),
        ));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content.as_deref(), Some("tail"));
        assert_eq!(out[1].kind, AgentMessageType::Result);
        assert_eq!(out[1].subtype.as_deref(), Some("success"));
        assert!(mapper.active_turn().is_none());

        // A late turn/start response for the finished turn is ignored.
        mapper.note_turn_started("turn-1");
        assert!(mapper.active_turn().is_none());
    }

    #[test]
    fn failed_turn_reports_error_subtype() {
        let mut mapper = ThreadEventMapper::new("t1");
        let out = mapper.map(&n(
            "turn/completed",
            json!({"threadId": "t1", "turn": {"id": "turn-2", "status": "failed", "error": {"message": "quota"}}}),
        ));
        assert_eq!(out[0].subtype.as_deref(), Some("error"));
        assert_eq!(out[0].content.as_deref(), Some("quota"));
    }

    #[test]
    fn error_notification_maps_to_error() {
        let mut mapper = ThreadEventMapper::new("t1");
        let out = mapper.map(&n(
            "error",
            json!({"threadId": "t1", "error": {"message": "stream disconnected"}}),
        ));
        assert_eq!(out[0].kind, AgentMessageType::Error);
        assert_eq!(out[0].content.as_deref(), Some("stream disconnected"));
    }
}
