//! Headless session backed by one Claude process in stream-json mode.
//!
//! The process is started with a known session id (`--session-id` for a new
//! conversation, `--resume` for an existing one), so the id is available
//! before Claude prints anything. User messages and control messages go to
//! stdin through a writer task; stdout is mapped by a [`StreamEventMapper`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::stream_events::StreamEventMapper;
use super::HeadlessSession;
use crate::config::{child_environment, AgentProviderConfig, HeadlessSpawnOptions};
use crate::error::ProviderError;
use crate::logging::{log_line, open_log_file, LogHandle};
use crate::message::AgentMessage;
use crate::queue::MessageQueue;
use crate::shell::AgentExit;
use crate::spawn::{spawn_piped, ProcessHandle, SpawnConfig};

/// Default binary name for the Claude CLI.
pub const CLAUDE_BINARY: &str = "claude";

/// Command-line arguments for a stream-json session.
pub(crate) fn stream_json_args(
    session_id: &str,
    resume: bool,
    model: Option<&str>,
    permission_mode: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--permission-prompt-tool".to_string(),
        "stdio".to_string(),
        "--permission-mode".to_string(),
        permission_mode.unwrap_or("default").to_string(),
    ];

    if let Some(model) = model {
        if !model.is_empty() {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
    }

    args.push(if resume { "--resume" } else { "--session-id" }.to_string());
    args.push(session_id.to_string());
    args
}

/// A user turn as Claude expects it on stdin.
fn user_envelope(content: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": content
        }
    })
}

pub struct ClaudeStreamSession {
    session_id: String,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    queue: Arc<MessageQueue<AgentMessage>>,
    process: ProcessHandle,
    closed: Arc<AtomicBool>,
    wire_log: LogHandle,
}

impl ClaudeStreamSession {
    /// Start Claude and, if given, send the initial prompt.
    pub fn spawn(config: &AgentProviderConfig, options: &HeadlessSpawnOptions) -> Result<Self, ProviderError> {
        let (session_id, resume) = match &options.resume_session_id {
            Some(id) => (id.clone(), true),
            None => (Uuid::new_v4().to_string(), false),
        };

        let args = stream_json_args(
            &session_id,
            resume,
            options.model.as_deref(),
            config.option_str("permissionMode"),
        );
        let env = child_environment(
            config,
            &options.environment_variables,
            options.root_directory.as_deref(),
        );
        let spawn_config = SpawnConfig::new(config.executable_or(CLAUDE_BINARY), args)
            .working_dir(Some(&options.working_directory))
            .shell_prefix(config.shell_prefix.as_deref())
            .envs(env);

        let wire_log = open_log_file(config.log_dir.as_deref(), &format!("claude-{}", session_id));
        let process = spawn_piped(&spawn_config, wire_log.clone())?;
        log::info!(
            "Started Claude session {} (pid {:?}, {})",
            session_id,
            process.handle.pid(),
            if resume { "resumed" } else { "new" }
        );

        let queue = Arc::new(MessageQueue::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(write_stdin(
            process.stdin,
            rx,
            Arc::clone(&queue),
            Arc::clone(&closed),
            wire_log.clone(),
        ));
        tokio::spawn(read_stdout(
            process.stdout,
            process.exited,
            tx.clone(),
            Arc::clone(&queue),
            Arc::clone(&closed),
            wire_log.clone(),
        ));

        let session = Self {
            session_id,
            outgoing: Mutex::new(Some(tx)),
            queue,
            process: process.handle,
            closed,
            wire_log,
        };

        if let Some(prompt) = &options.initial_prompt {
            session.send_message(prompt);
        }
        Ok(session)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_line(&self, line: Value) -> bool {
        let guard = self.outgoing.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(line.to_string()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl HeadlessSession for ClaudeStreamSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send_message(&self, content: &str) {
        if !self.send_line(user_envelope(content)) {
            log_line(&self.wire_log, "DROP", content);
            self.queue.push(
                AgentMessage::error("Failed to send message: session is closed")
                    .with_session_id(&self.session_id),
            );
        }
    }

    async fn interrupt(&self) -> Result<(), ProviderError> {
        let request = json!({
            "type": "control_request",
            "request_id": Uuid::new_v4().to_string(),
            "request": { "subtype": "interrupt" }
        });
        if self.send_line(request) {
            Ok(())
        } else {
            Err(ProviderError::TransportClosed)
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Closing Claude session {}", self.session_id);
        self.outgoing.lock().unwrap().take();
        self.process.kill();
        self.queue.close();
    }

    fn messages(&self) -> &MessageQueue<AgentMessage> {
        &self.queue
    }
}

impl Drop for ClaudeStreamSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
    queue: Arc<MessageQueue<AgentMessage>>,
    closed: Arc<AtomicBool>,
    wire_log: LogHandle,
) {
    while let Some(line) = lines.recv().await {
        log_line(&wire_log, "SEND", &line);
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = result {
            if !closed.load(Ordering::SeqCst) {
                log::warn!("Failed to write to Claude stdin: {}", e);
                queue.push(AgentMessage::error(format!("Failed to send message: {}", e)));
            }
            break;
        }
    }
}

async fn read_stdout(
    stdout: ChildStdout,
    exited: oneshot::Receiver<AgentExit>,
    replies: mpsc::UnboundedSender<String>,
    queue: Arc<MessageQueue<AgentMessage>>,
    closed: Arc<AtomicBool>,
    wire_log: LogHandle,
) {
    let mut mapper = StreamEventMapper::new();
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&buf);
                log_line(&wire_log, "RECV", &chunk);
                let output = mapper.feed(&chunk);
                for reply in output.replies {
                    let _ = replies.send(reply.to_string());
                }
                for message in output.messages {
                    queue.push(message);
                }
            }
            Err(e) => {
                log::debug!("Claude stdout read failed: {}", e);
                break;
            }
        }
    }
    drop(replies);

    for message in mapper.flush().messages {
        queue.push(message);
    }

    let exit = exited.await.ok();
    if !closed.load(Ordering::SeqCst) {
        match exit {
            Some(exit) if exit.code != 0 => {
                log::warn!("Claude exited with {:?}", exit);
                let mut message = AgentMessage::error(format!("Claude exited with code {}", exit.code));
                if let Some(id) = mapper.session_id() {
                    message = message.with_session_id(id);
                }
                queue.push(message);
            }
            _ => log::debug!("Claude exited cleanly"),
        }
    }
    queue.close();
}

// ============================================================================
// TESTS
// ============================================================================
