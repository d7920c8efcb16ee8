//! Claude stream-json output → [`AgentMessage`]s.
//!
//! # How This Mapper Works
//!
//! Claude writes one JSON object per line on stdout. The mapper:
//! 1. Buffers incoming data (which may end mid-line)
//! 2. Splits on newlines to get complete JSON lines
//! 3. Turns each line into zero or more messages, plus an optional reply
//!    that must be written back to Claude's stdin
//!
//! | line `type`         | output                                     |
//! |---------------------|--------------------------------------------|
//! | `system`            | `system` (init carries the session id)     |
//! | `assistant`         | one `assistant` per text block, one        |
//! |                     | `tool_use` per tool_use block              |
//! | `user`              | one `tool_result` per tool_result block    |
//! | `result`            | `result`                                   |
//! | `control_request`   | reply only (`can_use_tool` is approved)    |
//!
//! Unknown line types and malformed JSON produce nothing.

use serde_json::{json, Value};

use crate::message::{AgentMessage, AgentMessageType, ToolInfo};

/// What one chunk of output produced.
#[derive(Debug, Default, PartialEq)]
pub struct StreamOutput {
    pub messages: Vec<AgentMessage>,
    /// Lines to write back to stdin, in order.
    pub replies: Vec<Value>,
}

impl StreamOutput {
    fn extend(&mut self, other: StreamOutput) {
        self.messages.extend(other.messages);
        self.replies.extend(other.replies);
    }
}

/// Line mapper for one Claude process.
#[derive(Debug, Default)]
pub struct StreamEventMapper {
    /// Session id reported by Claude, once seen.
    session_id: Option<String>,

    /// Buffer for an incomplete trailing line.
    buffer: String,
}

impl StreamEventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Feed raw output and collect what every complete line produced.
    pub fn feed(&mut self, data: &str) -> StreamOutput {
        self.buffer.push_str(data);

        // Take ownership of the buffer so the lines can borrow it while
        // `self` is mutated below.
        let buffer = std::mem::take(&mut self.buffer);
        let mut lines: Vec<&str> = buffer.split('\n').collect();
        if let Some(incomplete) = lines.pop() {
            self.buffer = incomplete.to_string();
        }

        let mut output = StreamOutput::default();
        for line in lines {
            output.extend(self.parse_line(line));
        }
        output
    }

    /// Process whatever is left in the buffer (output that did not end in a
    /// newline).
    pub fn flush(&mut self) -> StreamOutput {
        let remaining = std::mem::take(&mut self.buffer);
        self.parse_line(&remaining)
    }

    fn parse_line(&mut self, line: &str) -> StreamOutput {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return StreamOutput::default();
        }
        let event: Value = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(_) => {
                log::debug!("Skipping non-JSON output line: {}", trimmed);
                return StreamOutput::default();
            }
        };

        if let Some(id) = event.get("session_id").and_then(Value::as_str) {
            self.session_id = Some(id.to_string());
        }

        let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "system" => {
                let mut message = self.message(AgentMessageType::System, &event);
                if let Some(subtype) = event.get("subtype").and_then(Value::as_str) {
                    message = message.with_subtype(subtype);
                }
                messages_only(vec![message])
            }

            "assistant" => {
                let mut messages = Vec::new();
                for block in content_blocks(&event) {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                messages.push(
                                    self.message(AgentMessageType::Assistant, &event)
                                        .with_content(text),
                                );
                            }
                        }
                        Some("tool_use") => messages.push(
                            self.message(AgentMessageType::ToolUse, &event)
                                .with_tool(ToolInfo {
                                    name: block.get("name").and_then(Value::as_str).map(str::to_string),
                                    id: block.get("id").and_then(Value::as_str).map(str::to_string),
                                    input: block.get("input").cloned(),
                                }),
                        ),
                        // thinking and anything newer
                        _ => {}
                    }
                }
                messages_only(messages)
            }

            "user" => {
                let messages = content_blocks(&event)
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
                    .map(|block| {
                        let mut message = self
                            .message(AgentMessageType::ToolResult, &event)
                            .with_tool(ToolInfo {
                                name: None,
                                id: block
                                    .get("tool_use_id")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                                input: None,
                            });
                        if let Some(text) = block.get("content").and_then(result_text) {
                            message = message.with_content(text);
                        }
                        message
                    })
                    .collect();
                messages_only(messages)
            }

            "result" => {
                let mut message = self.message(AgentMessageType::Result, &event);
                let subtype = match event.get("subtype").and_then(Value::as_str) {
                    Some(subtype) => subtype.to_string(),
                    None if event.get("is_error").and_then(Value::as_bool) == Some(true) => {
                        "error".to_string()
                    }
                    None => "success".to_string(),
                };
                message = message.with_subtype(subtype);
                if let Some(text) = event.get("result").and_then(Value::as_str) {
                    message = message.with_content(text);
                }
                messages_only(vec![message])
            }

            "control_request" => StreamOutput {
                messages: Vec::new(),
                replies: control_reply(&event).into_iter().collect(),
            },

            _ => StreamOutput::default(),
        }
    }

    fn message(&self, kind: AgentMessageType, event: &Value) -> AgentMessage {
        let message = AgentMessage::new(kind, event.clone());
        match &self.session_id {
            Some(id) => message.with_session_id(id),
            None => message,
        }
    }
}

fn messages_only(messages: Vec<AgentMessage>) -> StreamOutput {
    StreamOutput {
        messages,
        replies: Vec::new(),
    }
}

/// `message.content` as a list of blocks.
///
/// # Rust Concept: Returning Borrowed Slices
///
/// The blocks live inside `event`, so this returns `&[Value]` tied to the
/// event's lifetime instead of cloning them. A missing or non-array
/// `content` becomes the empty slice.
fn content_blocks(event: &Value) -> &[Value] {
    event
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// tool_result content is either a string or a list of text blocks.
fn result_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            }
        }
        _ => None,
    }
}

/// Reply to a control request: tool permission is always granted, anything
/// else is refused so Claude does not wait for us.
fn control_reply(event: &Value) -> Option<Value> {
    let request_id = event.get("request_id").and_then(Value::as_str)?;
    let subtype = event
        .pointer("/request/subtype")
        .and_then(Value::as_str)
        .unwrap_or("");

    if subtype == "can_use_tool" {
        let tool = event
            .pointer("/request/tool_name")
            .and_then(Value::as_str)
            .unwrap_or("?");
        log::info!("Auto-approving tool {} (request {})", tool, request_id);
        let input = event
            .pointer("/request/input")
            .cloned()
            .unwrap_or_else(|| json!({}));
        return Some(approval_response(request_id, input));
    }

    log::warn!("Unsupported control request {} ({})", subtype, request_id);
    Some(json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": format!("Unsupported control request: {}", subtype)
        }
    }))
}

/// A control_response granting a tool request with its input unchanged.
pub(crate) fn approval_response(request_id: &str, input: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "allow",
                "updatedInput": input
            }
        }
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_line(mapper: &mut StreamEventMapper, line: &str) -> StreamOutput {
        mapper.feed(&format!("{line}\n"))
    }

    #[test]
    fn partial_lines_wait_for_newline() {
        let mut mapper = StreamEventMapper::new();
        let out = mapper.feed(r#"{"type":"system","subtype":"init","#);
        assert!(out.messages.is_empty());

        let out = mapper.feed(r#""session_id":"sess-1"}"#);
        assert!(out.messages.is_empty());

        let out = mapper.feed("\n");
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].subtype.as_deref(), Some("init"));
        assert_eq!(mapper.session_id(), Some("sess-1"));
    }

    #[test]
    fn flush_processes_trailing_line() {
        let mut mapper = StreamEventMapper::new();
        mapper.feed(r#"{"type":"result","subtype":"success","result":"done"}"#);
        let out = mapper.flush();
        assert_eq!(out.messages[0].kind, AgentMessageType::Result);
        assert_eq!(out.messages[0].content.as_deref(), Some("done"));
        assert!(mapper.flush().messages.is_empty());
    }

    #[test]
    fn assistant_blocks_split_into_messages() {
        let mut mapper = StreamEventMapper::new();
        let out = feed_line(
            &mut mapper,
            r#"{"type":"assistant","session_id":"s","message":{"role":"assistant","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Hi"},{"type":"tool_use","id":"tu1","name":"Read","input":{"file_path":"/a"}}]}}"#,
        );
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].kind, AgentMessageType::Assistant);
        assert_eq!(out.messages[0].content.as_deref(), Some("Hi"));
        assert_eq!(out.messages[1].kind, AgentMessageType::ToolUse);
        let tool = out.messages[1].tool.as_ref().unwrap();
        assert_eq!(tool.name.as_deref(), Some("Read"));
        assert_eq!(tool.id.as_deref(), Some("tu1"));
        assert_eq!(out.messages[1].session_id.as_deref(), Some("s"));
        assert_eq!(out.messages[1].raw["type"], "assistant");
    }

    #[test]
    fn tool_results_from_user_lines() {
        let mut mapper = StreamEventMapper::new();
        let out = feed_line(
            &mut mapper,
            r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"tu1","content":[{"type":"text","text":"line 1"},{"type":"text","text":"line 2"}]}]}}"#,
        );
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].kind, AgentMessageType::ToolResult);
        assert_eq!(out.messages[0].content.as_deref(), Some("line 1\nline 2"));
        assert_eq!(
            out.messages[0].tool.as_ref().unwrap().id.as_deref(),
            Some("tu1")
        );
    }

    #[test]
    fn error_result_without_subtype() {
        let mut mapper = StreamEventMapper::new();
        let out = feed_line(&mut mapper, r#"{"type":"result","is_error":true,"result":"boom"}"#);
        assert_eq!(out.messages[0].subtype.as_deref(), Some("error"));
    }

    #[test]
    fn can_use_tool_is_approved_with_original_input() {
        let mut mapper = StreamEventMapper::new();
        let out = feed_line(
            &mut mapper,
            r#"{"type":"control_request","request_id":"req-123","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf test"}}}"#,
        );
        assert!(out.messages.is_empty());
        assert_eq!(out.replies.len(), 1);
        let reply = &out.replies[0];
        assert_eq!(reply["type"], "control_response");
        assert_eq!(reply["response"]["request_id"], "req-123");
        assert_eq!(reply["response"]["response"]["behavior"], "allow");
        assert_eq!(
            reply["response"]["response"]["updatedInput"]["command"],
            "rm -rf test"
        );
    }

    #[test]
    fn other_control_requests_are_refused() {
        let mut mapper = StreamEventMapper::new();
        let out = feed_line(
            &mut mapper,
            r#"{"type":"control_request","request_id":"req-9","request":{"subtype":"hook_callback"}}"#,
        );
        assert_eq!(out.replies[0]["response"]["subtype"], "error");
    }

    #[test]
    fn garbage_is_ignored() {
        let mut mapper = StreamEventMapper::new();
        let out = mapper.feed("not json\n{\"type\":\"stream_event\"}\n\n");
        assert_eq!(out, StreamOutput::default());
    }
}
