//! Agent process spawning over piped stdio.
//!
//! Backends that speak a line protocol on stdio (the Codex app-server, Claude
//! in stream-json mode) are started here. The child runs in a login shell and
//! its stdio is handed back as tokio streams; a watcher task owns the `Child`
//! and reports its exit status once.
//!
//! Killing is non-graceful and goes through [`ProcessHandle::kill`], which
//! signals the watcher task instead of touching the `Child` directly, so the
//! handle can be shared and killed from synchronous code.

use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use crate::error::ProviderError;
use crate::logging::{self, log_line, LogHandle};
use crate::shell::{build_login_shell_command, AgentExit};

/// What to run and how.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Path or bare name of the agent binary
    pub binary_path: String,
    /// Arguments to pass to the binary
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<String>,
    /// Custom shell prefix (e.g., "/bin/zsh -l -c")
    pub shell_prefix: Option<String>,
    /// Extra environment, applied over the inherited one
    pub env: Vec<(String, String)>,
}

impl SpawnConfig {
    pub fn new(binary_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args,
            working_dir: None,
            shell_prefix: None,
            env: Vec::new(),
        }
    }

    pub fn working_dir(mut self, dir: Option<&str>) -> Self {
        self.working_dir = dir.map(str::to_string);
        self
    }

    pub fn shell_prefix(mut self, prefix: Option<&str>) -> Self {
        self.shell_prefix = prefix.map(str::to_string);
        self
    }

    pub fn envs(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// Shareable kill switch for a spawned process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle {
    /// A handle whose kill requests arrive on the returned receiver.
    ///
    /// Used for in-memory backends that have no OS process behind them.
    pub fn detached() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(None, tx), rx)
    }

    fn new(pid: Option<u32>, kill_tx: oneshot::Sender<()>) -> Self {
        Self {
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the process immediately. Idempotent.
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// A running child with its stdio taken.
pub struct SpawnedProcess {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub handle: ProcessHandle,
    /// Resolves once with the exit status.
    pub exited: oneshot::Receiver<AgentExit>,
}

/// Spawn `config` in a login shell with piped stdio.
///
/// Must be called inside a tokio runtime. Stderr lines are forwarded to the
/// `log` facade at debug level and to `stderr_log` as `STDERR` records.
pub fn spawn_piped(config: &SpawnConfig, stderr_log: LogHandle) -> Result<SpawnedProcess, ProviderError> {
    let std_cmd = build_login_shell_command(
        &config.binary_path,
        &config.args,
        config.working_dir.as_deref(),
        config.shell_prefix.as_deref(),
    )?;

    let mut cmd = Command::from(std_cmd);
    cmd.envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let failure = |reason: String| {
        ProviderError::spawn_failure(&config.binary_path, config.working_dir.as_deref(), reason)
    };

    let mut child = cmd.spawn().map_err(|e| failure(e.to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| failure("Failed to capture stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| failure("Failed to capture stdout".to_string()))?;
    let stderr = child.stderr.take();

    let pid = child.id();
    log::debug!("Spawned {} (pid {:?})", config.binary_path, pid);

    if let Some(stderr) = stderr {
        tokio::spawn(forward_stderr(stderr, config.binary_path.clone(), stderr_log));
    }

    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = oneshot::channel();
    let binary = config.binary_path.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                log::debug!("Killing {} (pid {:?})", binary, pid);
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let exit = match status {
            Ok(status) => exit_from_status(status),
            Err(e) => {
                log::warn!("Failed to wait for {}: {}", binary, e);
                AgentExit { code: -1, signal: None }
            }
        };
        log::debug!("{} exited with {:?}", binary, exit);
        let _ = exit_tx.send(exit);
    });

    Ok(SpawnedProcess {
        stdin,
        stdout,
        handle: ProcessHandle::new(pid, kill_tx),
        exited: exit_rx,
    })
}

async fn forward_stderr(stderr: ChildStderr, binary: String, log: LogHandle) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("[{} stderr] {}", binary, line);
        log_line(&log, "STDERR", &line);
    }
}

pub(crate) fn exit_from_status(status: std::process::ExitStatus) -> AgentExit {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;

    AgentExit {
        code: status.code().unwrap_or(-1),
        signal,
    }
}

/// Spawn with stderr going only to the `log` facade.
pub fn spawn_piped_unlogged(config: &SpawnConfig) -> Result<SpawnedProcess, ProviderError> {
    spawn_piped(config, logging::disabled())
}

// ============================================================================
// TESTS
// ============================================================================
