//! Ref-counted owner of the shared app-server process.
//!
//! # States
//!
//! ```text
//!   IDLE ──acquire──► STARTING ──ok──► RUNNING ──last release──► IDLE
//!                        │                 │
//!                        └──error──► IDLE  └──process exit──► IDLE
//! ```
//!
//! `acquire()` bumps the count before anything else. Concurrent callers that
//! arrive while the server is starting all await the same shared startup, so
//! at most one process is ever spawned at a time. The startup itself runs on
//! its own task: a caller that gives up waiting does not abort it, and if the
//! count has dropped to zero by the time it finishes, the new server is shut
//! down on the spot.
//!
//! Every started server gets a new generation number. Leases, rollbacks and
//! exit watchers carry the generation they belong to, so a stale one never
//! touches a newer server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

use super::client::{AppServerClient, ClientInfo};
use super::launcher::{CodexAppServerLauncher, ServerConnection, ServerLauncher};
use crate::config::{effective_timeout, AgentProviderConfig};
use crate::error::ProviderError;
use crate::rpc::JsonRpcTransport;
use crate::shell::AgentExit;
use crate::spawn::ProcessHandle;

type StartupFuture = Shared<BoxFuture<'static, Result<Arc<AppServerClient>, ProviderError>>>;

#[derive(Default)]
struct ServerState {
    client: Option<Arc<AppServerClient>>,
    process: Option<ProcessHandle>,
    ref_count: usize,
    startup: Option<StartupFuture>,
    generation: u64,
}

impl ServerState {
    /// Kill the process, close the transport, and return to IDLE.
    fn shut_down(&mut self) {
        if let Some(client) = self.client.take() {
            client.close();
        }
        if let Some(process) = self.process.take() {
            process.kill();
        }
        self.startup = None;
        self.ref_count = 0;
        self.generation += 1;
    }

    fn release(&mut self, generation: u64) {
        if self.generation != generation {
            log::debug!("Ignoring release for retired server generation {}", generation);
            return;
        }
        if self.ref_count == 0 {
            log::warn!("Server released more times than acquired");
            return;
        }
        self.ref_count -= 1;
        log::debug!("Server released (ref count {})", self.ref_count);
        // While starting, the startup task sees the zero count and cleans up.
        if self.ref_count == 0 && self.client.is_some() {
            log::info!("Last holder released; shutting down app-server");
            self.shut_down();
        }
    }
}

/// Shares one app-server process among every headless session that needs it.
pub struct ServerManager {
    launcher: Arc<dyn ServerLauncher>,
    client_info: ClientInfo,
    state: Arc<Mutex<ServerState>>,
}

impl ServerManager {
    pub fn new(launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            launcher,
            client_info: ClientInfo::default(),
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    /// A manager that runs `codex app-server`.
    pub fn codex() -> Self {
        Self::new(Arc::new(CodexAppServerLauncher::new()))
    }

    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    /// Acquire the running server, starting it if needed.
    ///
    /// Each successful call must be paired with one [`release`](Self::release).
    pub async fn acquire(&self, config: &AgentProviderConfig) -> Result<Arc<AppServerClient>, ProviderError> {
        let lease = self.acquire_lease(config).await?;
        Ok(lease.into_client())
    }

    /// Like [`acquire`](Self::acquire), but the unit is returned when the
    /// lease is released or dropped.
    pub async fn acquire_lease(&self, config: &AgentProviderConfig) -> Result<ServerLease, ProviderError> {
        let (startup, generation) = {
            let mut state = self.state.lock().unwrap();
            state.ref_count += 1;
            let generation = state.generation;

            if let Some(client) = &state.client {
                log::debug!("Reusing running app-server (ref count {})", state.ref_count);
                return Ok(ServerLease::new(&self.state, client.clone(), generation));
            }

            match &state.startup {
                Some(startup) => {
                    log::debug!("Joining in-flight app-server startup");
                    (startup.clone(), generation)
                }
                None => {
                    let startup = self.begin_startup(config.clone(), generation);
                    state.startup = Some(startup.clone());
                    (startup, generation)
                }
            }
        };

        // Returns the unit if this caller fails or is cancelled mid-startup.
        let mut pending = PendingAcquire {
            state: &self.state,
            generation,
            armed: true,
        };
        let client = startup.await?;
        pending.armed = false;
        Ok(ServerLease::new(&self.state, client, generation))
    }

    /// Give back one unit. The server shuts down when the count reaches zero;
    /// extra releases are ignored.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        let generation = state.generation;
        state.release(generation);
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().unwrap().ref_count
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().client.is_some()
    }

    /// Shut the server down regardless of outstanding holders.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        if state.client.is_some() || state.startup.is_some() {
            log::info!("Shutting down app-server");
        }
        state.shut_down();
    }

    fn begin_startup(&self, config: AgentProviderConfig, generation: u64) -> StartupFuture {
        let task = tokio::spawn(run_startup(
            Arc::clone(&self.launcher),
            self.client_info.clone(),
            config,
            Arc::downgrade(&self.state),
            generation,
        ));
        async move {
            task.await.unwrap_or_else(|e| {
                Err(ProviderError::Protocol(format!("app-server startup task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.state.lock().unwrap().shut_down();
    }
}

struct PendingAcquire<'a> {
    state: &'a Arc<Mutex<ServerState>>,
    generation: u64,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().unwrap().release(self.generation);
        }
    }
}

/// One acquired unit of the shared server.
///
/// Released exactly once, by [`release`](Self::release) or on drop.
pub struct ServerLease {
    client: Arc<AppServerClient>,
    state: Weak<Mutex<ServerState>>,
    generation: u64,
    released: AtomicBool,
}

impl ServerLease {
    fn new(state: &Arc<Mutex<ServerState>>, client: Arc<AppServerClient>, generation: u64) -> Self {
        Self {
            client,
            state: Arc::downgrade(state),
            generation,
            released: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &Arc<AppServerClient> {
        &self.client
    }

    /// Return the unit. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(state) = self.state.upgrade() {
            state.lock().unwrap().release(self.generation);
        }
    }

    /// Keep the unit but stop tracking it; the caller releases through the
    /// manager.
    fn into_client(self) -> Arc<AppServerClient> {
        self.released.store(true, Ordering::SeqCst);
        Arc::clone(&self.client)
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        self.release();
    }
}

type Started = (Arc<AppServerClient>, ProcessHandle, oneshot::Receiver<AgentExit>);

/// How long to wait for an exit status after stdout closes during startup.
const EXIT_GRACE: Duration = Duration::from_secs(2);

async fn run_startup(
    launcher: Arc<dyn ServerLauncher>,
    client_info: ClientInfo,
    config: AgentProviderConfig,
    state: Weak<Mutex<ServerState>>,
    generation: u64,
) -> Result<Arc<AppServerClient>, ProviderError> {
    let timeout = effective_timeout(None, &config);
    let started = match tokio::time::timeout(timeout, connect(&*launcher, &client_info, &config)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::SpawnTimeout {
            executable: launcher.executable(&config),
            timeout,
        }),
    };

    let Some(state) = state.upgrade() else {
        if let Ok((client, process, _)) = &started {
            client.close();
            process.kill();
        }
        return Err(ProviderError::TransportClosed);
    };

    let mut guard = state.lock().unwrap();
    if guard.generation != generation {
        if let Ok((client, process, _)) = &started {
            client.close();
            process.kill();
        }
        return Err(ProviderError::TransportClosed);
    }
    guard.startup = None;

    match started {
        Err(e) => {
            log::warn!("app-server startup failed: {}", e);
            // Every holder of this generation was waiting on this startup.
            guard.ref_count = 0;
            guard.generation += 1;
            Err(e)
        }
        Ok((client, process, exited)) => {
            if guard.ref_count == 0 {
                log::info!("app-server started after every caller left; shutting it down");
                client.close();
                process.kill();
                guard.generation += 1;
                return Ok(client);
            }

            log::info!("app-server ready (ref count {})", guard.ref_count);
            guard.client = Some(Arc::clone(&client));
            guard.process = Some(process);
            tokio::spawn(watch_exit(exited, Arc::downgrade(&state), generation));
            Ok(client)
        }
    }
}

async fn connect(
    launcher: &dyn ServerLauncher,
    client_info: &ClientInfo,
    config: &AgentProviderConfig,
) -> Result<Started, ProviderError> {
    let ServerConnection {
        reader,
        writer,
        process,
        mut exited,
        wire_log,
    } = launcher.launch(config).await?;
    let transport = JsonRpcTransport::with_wire_log(reader, writer, wire_log);
    let client = Arc::new(AppServerClient::new(transport));

    // A missing binary still spawns the login shell, so the failure shows up
    // as an early exit or a closed stdout rather than a spawn error.
    let (initialized, early_exit) = tokio::select! {
        result = client.initialize(client_info) => (Some(result), None),
        Ok(exit) = &mut exited => (None, Some(exit)),
    };
    let early_exit = match (&initialized, early_exit) {
        (_, Some(exit)) => Some(exit),
        (Some(Err(ProviderError::TransportClosed)), None) => {
            tokio::time::timeout(EXIT_GRACE, &mut exited).await.ok().and_then(Result::ok)
        }
        _ => None,
    };

    if let Some(exit) = early_exit {
        client.close();
        return Err(ProviderError::spawn_failure(
            launcher.executable(config),
            config.working_directory.as_deref(),
            format!("exited with code {} before initialize", exit.code),
        ));
    }
    if let Some(Err(e)) = initialized {
        client.close();
        process.kill();
        return Err(e);
    }
    Ok((client, process, exited))
}

async fn watch_exit(exited: oneshot::Receiver<AgentExit>, state: Weak<Mutex<ServerState>>, generation: u64) {
    let exit = exited.await.ok();
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock().unwrap();
    if state.generation == generation && state.client.is_some() {
        log::warn!("app-server exited unexpectedly ({:?}); resetting", exit);
        state.shut_down();
    }
}

// ============================================================================
// TESTS
// ============================================================================
