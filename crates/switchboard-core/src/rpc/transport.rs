//! Multiplexed JSON-RPC over a byte-stream pair.
//!
//! One reader task splits the readable side on `\n`, parses each line and
//! dispatches it; one writer task owns the writable side and drains an
//! outgoing queue, so `notify` and `respond` never block. Requests are
//! correlated through a pending map keyed by id.
//!
//! ```text
//!   request() ──► pending[id] ──► outgoing ──► writer task ──► child stdin
//!                     ▲
//!   child stdout ──► reader task ──► response  ─┘
//!                               ├──► notification handler
//!                               └──► server-request handler
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::types::{
    IncomingMessage, RequestId, RpcErrorObject, RpcMessage, RpcNotification, RpcServerRequest,
};
use crate::error::ProviderError;
use crate::logging::{self, log_line, LogHandle};

/// Callback for notifications.
pub type NotificationHandler = Arc<dyn Fn(RpcNotification) + Send + Sync>;

/// Callback for server-initiated requests.
pub type ServerRequestHandler = Arc<dyn Fn(RpcServerRequest) + Send + Sync>;

type PendingRequests = HashMap<i64, oneshot::Sender<Result<Value, ProviderError>>>;

/// Handle to a JSON-RPC connection. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct JsonRpcTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<PendingRequests>,
    next_id: AtomicI64,
    closed: AtomicBool,
    on_notification: Mutex<Option<NotificationHandler>>,
    on_server_request: Mutex<Option<ServerRequestHandler>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    wire_log: LogHandle,
}

impl JsonRpcTransport {
    /// Start a transport over `reader`/`writer`. Must be called inside a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_wire_log(reader, writer, logging::disabled())
    }

    /// Like [`new`](Self::new), recording every line sent and received.
    pub fn with_wire_log<R, W>(reader: R, writer: W, wire_log: LogHandle) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(TransportInner {
            outgoing: Mutex::new(Some(tx)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            on_notification: Mutex::new(None),
            on_server_request: Mutex::new(None),
            reader_task: Mutex::new(None),
            wire_log,
        });

        tokio::spawn(write_loop(writer, rx, Arc::downgrade(&inner)));
        let reader_task = tokio::spawn(read_loop(reader, Arc::downgrade(&inner)));
        *inner.reader_task.lock().unwrap() = Some(reader_task);

        Self { inner }
    }

    /// Send a request and wait for its response.
    ///
    /// Rejects with the backend's error object, or with
    /// [`ProviderError::TransportClosed`] if the transport closes first. After
    /// close this fails immediately without writing anything.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(ProviderError::TransportClosed);
        }

        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().unwrap().insert(id, tx);

        // close() may have drained the map between the check above and the insert.
        if inner.is_closed() {
            inner.pending.lock().unwrap().remove(&id);
            return Err(ProviderError::TransportClosed);
        }

        let message = RpcMessage::request(id, method, non_null(params));
        if !inner.send(&message) {
            inner.pending.lock().unwrap().remove(&id);
            return Err(ProviderError::TransportClosed);
        }

        rx.await.unwrap_or(Err(ProviderError::TransportClosed))
    }

    /// Send a one-way notification. No-op after close.
    pub fn notify(&self, method: &str, params: Option<Value>) {
        self.inner
            .send(&RpcMessage::notification(method, params.and_then(non_null)));
    }

    /// Answer a server-initiated request. No-op after close.
    pub fn respond(&self, id: RequestId, result: Value) {
        self.inner.send(&RpcMessage::response(id, result));
    }

    /// Reject a server-initiated request. No-op after close.
    pub fn respond_error(&self, id: RequestId, code: i64, message: &str) {
        self.inner.send(&RpcMessage::error_response(
            id,
            RpcErrorObject {
                code: Some(code),
                message: Some(message.to_string()),
                data: None,
            },
        ));
    }

    /// Register the notification handler, replacing any previous one.
    ///
    /// Only one handler is kept; wrap it to fan out to several listeners.
    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(RpcNotification) + Send + Sync + 'static,
    {
        if !self.inner.is_closed() {
            *self.inner.on_notification.lock().unwrap() = Some(Arc::new(handler));
        }
    }

    /// Register the server-request handler, replacing any previous one.
    pub fn on_server_request<F>(&self, handler: F)
    where
        F: Fn(RpcServerRequest) + Send + Sync + 'static,
    {
        if !self.inner.is_closed() {
            *self.inner.on_server_request.lock().unwrap() = Some(Arc::new(handler));
        }
    }

    /// Close the transport. Idempotent.
    ///
    /// Rejects every pending request, drops the handlers, stops reading, and
    /// lets the writer flush what is already queued before shutting down.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// A handle that does not keep the transport alive. Handlers that need
    /// to write back should capture this instead of a clone.
    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning counterpart of [`JsonRpcTransport`].
#[derive(Clone)]
pub struct WeakTransport {
    inner: Weak<TransportInner>,
}

impl WeakTransport {
    pub fn upgrade(&self) -> Option<JsonRpcTransport> {
        self.inner.upgrade().map(|inner| JsonRpcTransport { inner })
    }
}

impl TransportInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, message: &RpcMessage) -> bool {
        let line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Failed to serialize JSON-RPC message: {}", e);
                return false;
            }
        };
        let guard = self.outgoing.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => {
                log_line(&self.wire_log, "SEND", &line);
                tx.send(line).is_ok()
            }
            None => false,
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.outgoing.lock().unwrap().take();

        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        if !pending.is_empty() {
            log::debug!("Rejecting {} pending JSON-RPC requests on close", pending.len());
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(ProviderError::TransportClosed));
        }

        self.on_notification.lock().unwrap().take();
        self.on_server_request.lock().unwrap().take();

        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn handle_line(&self, bytes: &[u8]) {
        let line = String::from_utf8_lossy(bytes);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        log_line(&self.wire_log, "RECV", trimmed);

        let message: RpcMessage = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Dropping malformed JSON-RPC line ({}): {}", e, trimmed);
                return;
            }
        };

        match message.classify() {
            Some(IncomingMessage::Response { id, outcome }) => {
                let id = match id {
                    RequestId::Integer(id) => id,
                    other => {
                        log::debug!("Dropping response with non-integer id {}", other);
                        return;
                    }
                };
                let waiter = self.pending.lock().unwrap().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome.map_err(ProviderError::from));
                    }
                    None => log::debug!("Dropping response for unknown request id {}", id),
                }
            }
            Some(IncomingMessage::Notification(notification)) => {
                let handler = self.on_notification.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler(notification);
                }
            }
            Some(IncomingMessage::ServerRequest(request)) => {
                let handler = self.on_server_request.lock().unwrap().clone();
                match handler {
                    Some(handler) => handler(request),
                    None => log::warn!(
                        "No handler for server request {} (id {})",
                        request.method,
                        request.id
                    ),
                }
            }
            None => log::debug!("Dropping JSON-RPC message without id or method"),
        }
    }
}

fn non_null(value: Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

async fn read_loop<R>(reader: R, inner: Weak<TransportInner>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => match inner.upgrade() {
                Some(inner) => inner.handle_line(&buf),
                None => return,
            },
            Err(e) => {
                log::debug!("JSON-RPC read failed: {}", e);
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        log::debug!("JSON-RPC stream ended; closing transport");
        inner.close();
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    inner: Weak<TransportInner>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(line) = outgoing.recv().await {
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            log::warn!("JSON-RPC write failed: {}", e);
            if let Some(inner) = inner.upgrade() {
                inner.close();
            }
            break;
        }
    }
    let _ = writer.shutdown().await;
}

// ============================================================================
// TESTS
// ============================================================================
