//! Headless session backed by a thread on the shared app-server.
//!
//! The session holds one [`ServerLease`] for its whole life. Notifications
//! arrive through its own [`Subscription`], are filtered and mapped by a
//! [`ThreadEventMapper`], and land in the session's message queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::thread_events::ThreadEventMapper;
use super::HeadlessSession;
use crate::config::HeadlessSpawnOptions;
use crate::error::ProviderError;
use crate::message::AgentMessage;
use crate::queue::MessageQueue;
use crate::server::{ServerLease, Subscription};

/// Prompt used for the first turn of a new thread when the caller gave none.
pub const DEFAULT_TURN_PROMPT: &str = "Hello";

pub struct AppServerSession {
    thread_id: String,
    model: Option<String>,
    lease: ServerLease,
    mapper: Arc<Mutex<ThreadEventMapper>>,
    queue: Arc<MessageQueue<AgentMessage>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
    closed: Arc<AtomicBool>,
}

impl AppServerSession {
    /// Create or resume a thread and start streaming its events.
    ///
    /// A new thread gets a synthesized `system/init` message and a first turn
    /// (the initial prompt, or [`DEFAULT_TURN_PROMPT`]). A resumed thread only
    /// runs a turn when an initial prompt is given. On failure the lease is
    /// released.
    pub async fn start(lease: ServerLease, options: &HeadlessSpawnOptions) -> Result<Self, ProviderError> {
        let client = Arc::clone(lease.client());
        let model = options.model.clone();

        // Subscribe first so nothing sent while the thread is being created is lost.
        let mut subscription = client.subscribe();

        let (thread_id, is_new) = match &options.resume_session_id {
            Some(id) => (
                client
                    .thread_resume(id, &options.working_directory, model.as_deref())
                    .await?,
                false,
            ),
            None => (
                client
                    .thread_start(&options.working_directory, model.as_deref())
                    .await?,
                true,
            ),
        };
        log::info!(
            "{} app-server thread {} in {}",
            if is_new { "Started" } else { "Resumed" },
            thread_id,
            options.working_directory
        );

        let queue = Arc::new(MessageQueue::new());
        let mapper = Arc::new(Mutex::new(ThreadEventMapper::new(&thread_id)));
        let closed = Arc::new(AtomicBool::new(false));

        if is_new {
            queue.push(AgentMessage::system_init(
                &thread_id,
                json!({ "type": "system", "subtype": "init", "threadId": thread_id }),
            ));
        }

        // Replay whatever arrived before the thread id was known.
        let early = subscription.drain_ready();
        if !early.is_empty() {
            log::debug!("Replaying {} early notifications for {}", early.len(), thread_id);
        }
        {
            let mut mapper = mapper.lock().unwrap();
            for notification in &early {
                for message in mapper.map(notification) {
                    queue.push(message);
                }
            }
        }

        let pump = tokio::spawn(pump_notifications(
            subscription,
            Arc::clone(&mapper),
            Arc::clone(&queue),
            Arc::clone(&closed),
        ));

        let session = Self {
            thread_id,
            model,
            lease,
            mapper,
            queue,
            pump: Mutex::new(Some(pump)),
            runtime: Handle::current(),
            closed,
        };

        match (&options.initial_prompt, is_new) {
            (Some(prompt), _) => session.send_message(prompt),
            (None, true) => session.send_message(DEFAULT_TURN_PROMPT),
            (None, false) => {}
        }

        Ok(session)
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeadlessSession for AppServerSession {
    fn session_id(&self) -> &str {
        &self.thread_id
    }

    fn send_message(&self, content: &str) {
        if self.is_closed() {
            log::warn!("Dropping message for closed thread {}", self.thread_id);
            return;
        }

        let client = Arc::clone(self.lease.client());
        let thread_id = self.thread_id.clone();
        let model = self.model.clone();
        let mapper = Arc::clone(&self.mapper);
        let queue = Arc::clone(&self.queue);
        let content = content.to_string();

        self.runtime.spawn(async move {
            match client.turn_start(&thread_id, &content, model.as_deref()).await {
                Ok(Some(turn_id)) => mapper.lock().unwrap().note_turn_started(&turn_id),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("turn/start failed for {}: {}", thread_id, e);
                    queue.push(
                        AgentMessage::error(format!("Failed to start turn: {}", e))
                            .with_session_id(&thread_id),
                    );
                }
            }
        });
    }

    async fn interrupt(&self) -> Result<(), ProviderError> {
        let turn_id = self.mapper.lock().unwrap().active_turn().map(str::to_string);
        match turn_id {
            Some(turn_id) => {
                log::debug!("Interrupting turn {} on {}", turn_id, self.thread_id);
                self.lease
                    .client()
                    .turn_interrupt(&self.thread_id, &turn_id)
                    .await
            }
            None => Ok(()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Closing thread session {}", self.thread_id);

        if let Some(message) = self.mapper.lock().unwrap().flush() {
            self.queue.push(message);
        }
        self.queue.close();
        // Dropping the pump drops its subscription.
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        self.lease.release();
    }

    fn messages(&self) -> &MessageQueue<AgentMessage> {
        &self.queue
    }
}

impl Drop for AppServerSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump_notifications(
    mut subscription: Subscription,
    mapper: Arc<Mutex<ThreadEventMapper>>,
    queue: Arc<MessageQueue<AgentMessage>>,
    closed: Arc<AtomicBool>,
) {
    while let Some(notification) = subscription.recv().await {
        let messages = mapper.lock().unwrap().map(&notification);
        for message in messages {
            queue.push(message);
        }
    }

    if !closed.load(Ordering::SeqCst) {
        // The server went away underneath us.
        let thread_id = {
            let mut mapper = mapper.lock().unwrap();
            if let Some(message) = mapper.flush() {
                queue.push(message);
            }
            mapper.thread_id().to_string()
        };
        queue.push(AgentMessage::error("app-server connection closed").with_session_id(thread_id));
        queue.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================
