//! Typed façade over the app-server's JSON-RPC methods.
//!
//! The transport accepts a single notification handler. Several headless
//! sessions share one server, so the client installs one handler that feeds a
//! [`NotificationRouter`], and each session takes its own [`Subscription`].
//! Every subscriber sees every notification; sessions filter by thread id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::rpc::{JsonRpcTransport, RpcNotification, RpcServerRequest};

/// JSON-RPC "method not found".
const METHOD_NOT_FOUND: i64 = -32601;

/// Identity sent in the `initialize` handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "switchboard".to_string(),
            title: "Switchboard".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A model advertised by `model/list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppServerModel {
    pub id: String,
    pub display_name: String,
}

// ============================================================================
// Notification fan-out
// ============================================================================

/// Broadcasts notifications to every live subscription.
#[derive(Default)]
pub struct NotificationRouter {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<RpcNotification>>>,
    next_id: AtomicU64,
}

impl NotificationRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start receiving notifications. Anything dispatched after this call is
    /// buffered in the subscription until read.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().insert(id, tx);
        Subscription {
            id,
            receiver: rx,
            router: Arc::downgrade(self),
        }
    }

    pub fn dispatch(&self, notification: RpcNotification) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|_, tx| tx.send(notification.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Drop every subscription sender so receivers observe end-of-stream.
    pub fn close(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }
}

/// One listener's view of the notification stream. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<RpcNotification>,
    router: Weak<NotificationRouter>,
}

impl Subscription {
    /// Next notification, or `None` once the router is closed.
    pub async fn recv(&mut self) -> Option<RpcNotification> {
        self.receiver.recv().await
    }

    /// Everything already delivered, without waiting.
    pub fn drain_ready(&mut self) -> Vec<RpcNotification> {
        let mut ready = Vec::new();
        while let Ok(notification) = self.receiver.try_recv() {
            ready.push(notification);
        }
        ready
    }

    pub fn unsubscribe(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.id);
        }
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.id);
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Typed request wrappers plus the notification router for one server.
pub struct AppServerClient {
    transport: JsonRpcTransport,
    router: Arc<NotificationRouter>,
}

impl std::fmt::Debug for AppServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServerClient").finish_non_exhaustive()
    }
}

impl AppServerClient {
    /// Wrap a transport: route its notifications and answer server requests.
    pub fn new(transport: JsonRpcTransport) -> Self {
        let router = NotificationRouter::new();

        let fan_out = Arc::downgrade(&router);
        transport.on_notification(move |notification| {
            if let Some(router) = fan_out.upgrade() {
                router.dispatch(notification);
            }
        });

        let responder = transport.downgrade();
        transport.on_server_request(move |request| {
            if let Some(transport) = responder.upgrade() {
                answer_server_request(&transport, request);
            }
        });

        Self { transport, router }
    }

    /// `initialize` request followed by the `initialized` notification.
    pub async fn initialize(&self, info: &ClientInfo) -> Result<Value, ProviderError> {
        let result = self
            .transport
            .request("initialize", json!({ "clientInfo": info }))
            .await?;
        self.transport.notify("initialized", None);
        Ok(result)
    }

    /// Create a thread and return its id. Runs no turn.
    pub async fn thread_start(&self, cwd: &str, model: Option<&str>) -> Result<String, ProviderError> {
        let mut params = json!({ "cwd": cwd });
        if let Some(model) = model {
            params["model"] = json!(model);
        }
        let result = self.transport.request("thread/start", params).await?;
        thread_id_from(&result, "thread/start")
    }

    /// Reopen an existing thread and return its id.
    pub async fn thread_resume(
        &self,
        thread_id: &str,
        cwd: &str,
        model: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut params = json!({ "threadId": thread_id, "cwd": cwd });
        if let Some(model) = model {
            params["model"] = json!(model);
        }
        let result = self.transport.request("thread/resume", params).await?;
        thread_id_from(&result, "thread/resume").or_else(|_| Ok(thread_id.to_string()))
    }

    pub async fn thread_read(&self, thread_id: &str) -> Result<Value, ProviderError> {
        self.transport
            .request("thread/read", json!({ "threadId": thread_id }))
            .await
    }

    /// Start a turn with a text prompt. Returns the turn id when the server
    /// reports one.
    pub async fn turn_start(
        &self,
        thread_id: &str,
        text: &str,
        model: Option<&str>,
    ) -> Result<Option<String>, ProviderError> {
        let mut params = json!({
            "threadId": thread_id,
            "input": [{ "type": "text", "text": text }],
        });
        if let Some(model) = model {
            params["model"] = json!(model);
        }
        let result = self.transport.request("turn/start", params).await?;
        Ok(result
            .pointer("/turn/id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub async fn turn_interrupt(&self, thread_id: &str, turn_id: &str) -> Result<(), ProviderError> {
        self.transport
            .request(
                "turn/interrupt",
                json!({ "threadId": thread_id, "turnId": turn_id }),
            )
            .await
            .map(|_| ())
    }

    /// All models, following `nextCursor` pages.
    pub async fn model_list(&self) -> Result<Vec<AppServerModel>, ProviderError> {
        let mut models = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.transport.request("model/list", params).await?;
            let data = result
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| ProviderError::Protocol("model/list returned no data".to_string()))?;

            for item in data {
                let Some(id) = item
                    .get("model")
                    .and_then(Value::as_str)
                    .or_else(|| item.get("id").and_then(Value::as_str))
                else {
                    continue;
                };
                let display_name = item
                    .get("displayName")
                    .and_then(Value::as_str)
                    .unwrap_or(id);
                models.push(AppServerModel {
                    id: id.to_string(),
                    display_name: display_name.to_string(),
                });
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(models)
    }

    pub fn subscribe(&self) -> Subscription {
        self.router.subscribe()
    }

    pub fn router(&self) -> &Arc<NotificationRouter> {
        &self.router
    }

    pub fn transport(&self) -> &JsonRpcTransport {
        &self.transport
    }

    /// Close the transport and end every subscription.
    pub fn close(&self) {
        self.transport.close();
        self.router.close();
    }
}

/// Accept every approval request; refuse anything else so the server never
/// waits on us.
fn answer_server_request(transport: &JsonRpcTransport, request: RpcServerRequest) {
    if request.method.ends_with("requestApproval") {
        log::info!(
            "Auto-approving {} (id {}, thread {})",
            request.method,
            request.id,
            request
                .params
                .as_ref()
                .and_then(|p| p.get("threadId"))
                .and_then(Value::as_str)
                .unwrap_or("-")
        );
        transport.respond(request.id, json!({ "decision": "accept" }));
    } else {
        log::warn!("Unhandled server request {} (id {})", request.method, request.id);
        transport.respond_error(request.id, METHOD_NOT_FOUND, "Method not found");
    }
}

fn thread_id_from(result: &Value, method: &str) -> Result<String, ProviderError> {
    result
        .pointer("/thread/id")
        .or_else(|| result.get("threadId"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Protocol(format!("{} returned no thread id", method)))
}

// ============================================================================
// TESTS
// ============================================================================
