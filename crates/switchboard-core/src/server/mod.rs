//! The shared app-server process and the client used to talk to it.
//!
//! - `launcher` - Starting the process (the OS seam)
//! - `client` - Typed requests and notification fan-out
//! - `manager` - Ref counting and startup coalescing

mod client;
mod launcher;
mod manager;

pub use client::{AppServerClient, AppServerModel, ClientInfo, NotificationRouter, Subscription};
pub use launcher::{CodexAppServerLauncher, ServerConnection, ServerLauncher, CODEX_BINARY};
pub use manager::{ServerLease, ServerManager};

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory app-server for manager and session tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::{mpsc, oneshot};

    use super::{ServerConnection, ServerLauncher};
    use crate::config::AgentProviderConfig;
    use crate::error::ProviderError;
    use crate::logging;
    use crate::shell::AgentExit;
    use crate::spawn::ProcessHandle;

    /// Canned response bodies by method: `{"result": ...}` or `{"error": ...}`.
    type Overrides = Arc<Mutex<HashMap<String, Value>>>;

    /// Notifications pushed ahead of the response to a method.
    type Preludes = Arc<Mutex<HashMap<String, Vec<Value>>>>;

    pub(crate) struct FakeLauncher {
        launches: AtomicUsize,
        init_delay: Mutex<Duration>,
        fail_launch: AtomicBool,
        never_initialize: Arc<AtomicBool>,
        overrides: Overrides,
        preludes: Preludes,
        servers: Mutex<Vec<FakeServer>>,
    }

    impl FakeLauncher {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                init_delay: Mutex::new(Duration::ZERO),
                fail_launch: AtomicBool::new(false),
                never_initialize: Arc::new(AtomicBool::new(false)),
                overrides: Arc::new(Mutex::new(HashMap::new())),
                preludes: Arc::new(Mutex::new(HashMap::new())),
                servers: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn init_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
            *self.init_delay.lock().unwrap() = delay;
            self
        }

        pub(crate) fn fail_launch(self: Arc<Self>) -> Arc<Self> {
            self.fail_launch.store(true, Ordering::SeqCst);
            self
        }

        pub(crate) fn never_initialize(self: Arc<Self>) -> Arc<Self> {
            self.set_never_initialize(true);
            self
        }

        pub(crate) fn set_never_initialize(&self, value: bool) {
            self.never_initialize.store(value, Ordering::SeqCst);
        }

        /// Answer `method` with `body` instead of the default result.
        pub(crate) fn respond_to(&self, method: &str, body: Value) {
            self.overrides.lock().unwrap().insert(method.to_string(), body);
        }

        /// Send `notifications` just before answering `method`.
        pub(crate) fn before_reply(&self, method: &str, notifications: Vec<Value>) {
            self.preludes.lock().unwrap().insert(method.to_string(), notifications);
        }

        pub(crate) fn launch_count(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        pub(crate) fn server(&self, index: usize) -> FakeServer {
            self.servers.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl ServerLauncher for FakeLauncher {
        async fn launch(&self, config: &AgentProviderConfig) -> Result<ServerConnection, ProviderError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(ProviderError::spawn_failure(
                    "codex",
                    config.working_directory.as_deref(),
                    "No such file or directory",
                ));
            }

            let (client_end, server_end) = tokio::io::duplex(64 * 1024);
            let (client_read, client_write) = tokio::io::split(client_end);
            let (server_read, mut server_write) = tokio::io::split(server_end);

            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
            let (process, kill_rx) = ProcessHandle::detached();
            let (exit_tx, exit_rx) = oneshot::channel();

            let server = FakeServer {
                received: Arc::new(Mutex::new(Vec::new())),
                outbound: outbound_tx.clone(),
                killed: Arc::new(AtomicBool::new(false)),
                exit: Arc::new(Mutex::new(Some(exit_tx))),
            };
            self.servers.lock().unwrap().push(server.clone());

            // A dropped handle counts as a kill, like kill_on_drop.
            let on_kill = server.clone();
            tokio::spawn(async move {
                let _ = kill_rx.await;
                on_kill.killed.store(true, Ordering::SeqCst);
                on_kill.exit_with(AgentExit { code: -1, signal: Some(9) });
            });

            tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    let line = format!("{}\n", message);
                    if server_write.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });

            let received = server.received.clone();
            let overrides = self.overrides.clone();
            let preludes = self.preludes.clone();
            let never_initialize = self.never_initialize.load(Ordering::SeqCst);
            let init_delay = *self.init_delay.lock().unwrap();
            tokio::spawn(async move {
                let mut lines = BufReader::new(server_read).lines();
                let mut counter = 0;
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(message) = serde_json::from_str::<Value>(&line) else {
                        continue;
                    };
                    received.lock().unwrap().push(message.clone());

                    let (Some(id), Some(method)) = (message.get("id"), message["method"].as_str()) else {
                        continue;
                    };
                    if method == "initialize" {
                        if never_initialize {
                            continue;
                        }
                        tokio::time::sleep(init_delay).await;
                    }

                    counter += 1;
                    let canned = overrides.lock().unwrap().get(method).cloned();
                    let mut reply = canned.unwrap_or_else(|| {
                        let result = match method {
                            "thread/start" => json!({"thread": {"id": format!("thr_{}", counter)}}),
                            "thread/resume" => json!({"thread": {"id": message["params"]["threadId"]}}),
                            "turn/start" => json!({"turn": {"id": format!("turn_{}", counter)}}),
                            _ => json!({}),
                        };
                        json!({ "result": result })
                    });
                    reply["id"] = id.clone();
                    let prelude = preludes.lock().unwrap().get(method).cloned().unwrap_or_default();
                    for notification in prelude {
                        let _ = outbound_tx.send(notification);
                    }
                    if outbound_tx.send(reply).is_err() {
                        break;
                    }
                }
            });

            Ok(ServerConnection {
                reader: Box::new(client_read),
                writer: Box::new(client_write),
                process,
                exited: exit_rx,
                wire_log: logging::disabled(),
            })
        }

        fn executable(&self, _config: &AgentProviderConfig) -> String {
            "codex".to_string()
        }
    }

    /// Handle on one launched fake server.
    #[derive(Clone)]
    pub(crate) struct FakeServer {
        received: Arc<Mutex<Vec<Value>>>,
        outbound: mpsc::UnboundedSender<Value>,
        killed: Arc<AtomicBool>,
        exit: Arc<Mutex<Option<oneshot::Sender<AgentExit>>>>,
    }

    impl FakeServer {
        /// Push a raw message (usually a notification) to the client.
        pub(crate) fn send(&self, message: Value) {
            let _ = self.outbound.send(message);
        }

        pub(crate) fn notify(&self, method: &str, params: Value) {
            self.send(json!({ "method": method, "params": params }));
        }

        /// Simulate the process dying on its own.
        pub(crate) fn crash(&self) {
            self.exit_with(AgentExit { code: 1, signal: None });
        }

        pub(crate) fn was_killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }

        /// Messages received with the given method, in arrival order.
        pub(crate) fn requests(&self, method: &str) -> Vec<Value> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m["method"] == method)
                .cloned()
                .collect()
        }

        /// Wait until `count` messages with `method` have arrived.
        pub(crate) async fn wait_for(&self, method: &str, count: usize) -> Vec<Value> {
            for _ in 0..500 {
                let found = self.requests(method);
                if found.len() >= count {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {} x{}", method, count);
        }

        fn exit_with(&self, exit: AgentExit) {
            if let Some(tx) = self.exit.lock().unwrap().take() {
                let _ = tx.send(exit);
            }
        }
    }
}
