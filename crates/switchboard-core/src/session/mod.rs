//! Agent sessions.
//!
//! Headless sessions are message-stream driven and share one contract,
//! [`HeadlessSession`], whether they run as a thread on a shared app-server
//! ([`AppServerSession`]) or as their own Claude process
//! ([`ClaudeStreamSession`]). Interactive sessions run a CLI in a PTY
//! ([`InteractiveSession`]).

mod interactive;
mod stream;
mod stream_events;
mod thread;
mod thread_events;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::message::AgentMessage;
use crate::queue::MessageQueue;

pub use interactive::{InteractiveCommand, InteractiveSession, PtyEvent};
pub use stream::{ClaudeStreamSession, CLAUDE_BINARY};
pub use stream_events::{StreamEventMapper, StreamOutput};
pub use thread::{AppServerSession, DEFAULT_TURN_PROMPT};
pub use thread_events::ThreadEventMapper;

/// A programmatic conversation with an agent.
///
/// Messages arrive on [`messages`](Self::messages) until the session ends,
/// after which the queue is closed.
#[async_trait]
pub trait HeadlessSession: Send + Sync {
    /// Backend session (or thread) id, known from the start.
    fn session_id(&self) -> &str;

    /// Send a user message. Never fails synchronously; problems arrive as
    /// error messages on the queue.
    fn send_message(&self, content: &str);

    /// Ask the backend to stop the current turn.
    async fn interrupt(&self) -> Result<(), ProviderError>;

    /// End the session. Idempotent.
    fn close(&self);

    fn messages(&self) -> &MessageQueue<AgentMessage>;

    /// Next message, or `None` once the session has ended.
    async fn recv(&self) -> Option<AgentMessage> {
        self.messages().recv().await
    }
}
