//! Interactive agent sessions running inside a pseudo-terminal.
//!
//! The agent CLI is started in a login shell on the slave side of a PTY. A
//! dedicated OS thread reads the master side, because portable-pty only offers
//! blocking readers. That thread answers terminal probes, watches the output
//! for the backend's session id and fans each chunk out to callbacks and the
//! [`events`](InteractiveSession::events) queue.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use std::{
    io::{Read, Write},
    sync::{Arc, Mutex},
    thread,
};

use crate::config::{child_environment, AgentProviderConfig, InteractiveSpawnOptions};
use crate::error::ProviderError;
use crate::queue::MessageQueue;
use crate::shell::{login_shell_argv, path_with_binary_dir, AgentExit};

/// Cursor position query some CLIs send before drawing.
const CURSOR_POSITION_QUERY: &[u8] = b"\x1b[6n";

/// Canned answer: row 1, column 1.
const CURSOR_POSITION_REPLY: &[u8] = b"\x1b[1;1R";

/// How much trailing output is kept for session-id discovery.
const ID_SCAN_WINDOW: usize = 4096;

/// What a provider wants run in the terminal.
#[derive(Debug, Clone)]
pub struct InteractiveCommand {
    /// Binary to exec.
    pub binary: String,
    /// Arguments before the positional prompt.
    pub args: Vec<String>,
    /// Id reported until the backend prints its own.
    pub session_id: String,
    /// Pattern for the backend's id in its output. Capture group 1 is used
    /// when present, the whole match otherwise. `None` when the id passed to
    /// the CLI is already authoritative.
    pub id_marker: Option<Regex>,
}

/// Output of an interactive session, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Exit(AgentExit),
}

type DataCallback = Box<dyn Fn(&[u8]) + Send + Sync>;
type ExitCallback = Box<dyn Fn(&AgentExit) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    data: Vec<DataCallback>,
    exit: Vec<ExitCallback>,
    exited: Option<AgentExit>,
}

/// State shared between the session handle and its reader thread.
struct Shared {
    session_id: Mutex<String>,
    writer: Mutex<Box<dyn Write + Send>>,
    listeners: Mutex<Listeners>,
    events: MessageQueue<PtyEvent>,
}

impl Shared {
    fn write(&self, data: &[u8]) -> Result<(), ProviderError> {
        let mut writer = self.writer.lock().unwrap();
        writer
            .write_all(data)
            .map_err(|e| ProviderError::Pty(format!("Write failed: {}", e)))?;
        writer
            .flush()
            .map_err(|e| ProviderError::Pty(format!("Flush failed: {}", e)))
    }

    fn emit_data(&self, chunk: &[u8]) {
        self.events.push(PtyEvent::Data(chunk.to_vec()));
        let listeners = self.listeners.lock().unwrap();
        for callback in &listeners.data {
            callback(chunk);
        }
    }

    fn emit_exit(&self, exit: AgentExit) {
        self.events.push(PtyEvent::Exit(exit.clone()));
        self.events.close();
        let mut listeners = self.listeners.lock().unwrap();
        for callback in &listeners.exit {
            callback(&exit);
        }
        listeners.exited = Some(exit);
    }
}

/// A running agent CLI attached to a PTY.
///
/// Callbacks run on the reader thread and must not register further
/// callbacks on the same session.
pub struct InteractiveSession {
    shared: Arc<Shared>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl InteractiveSession {
    /// Start `command` in a login shell inside a new PTY.
    ///
    /// The initial prompt is handed to the shell as `$1`, never spliced into
    /// the command string.
    pub fn spawn(
        command: InteractiveCommand,
        config: &AgentProviderConfig,
        options: &InteractiveSpawnOptions,
    ) -> Result<Self, ProviderError> {
        let argv = login_shell_argv(
            &command.binary,
            &command.args,
            options.initial_prompt.as_deref(),
            config.shell_prefix.as_deref(),
        )?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProviderError::Pty(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.cwd(&options.working_directory);
        for (key, value) in child_environment(
            config,
            &options.environment_variables,
            options.root_directory.as_deref(),
        ) {
            cmd.env(key, value);
        }
        if let Some(path) = path_with_binary_dir(&command.binary) {
            cmd.env("PATH", path);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            ProviderError::spawn_failure(
                &command.binary,
                Some(&options.working_directory),
                e.to_string(),
            )
        })?;

        // Drop slave - we only need the master side
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProviderError::Pty(format!("Failed to clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProviderError::Pty(format!("Failed to take writer: {}", e)))?;

        let pid = child.process_id();
        let killer = child.clone_killer();
        log::info!(
            "Started interactive {} session {} (pid {:?})",
            command.binary,
            command.session_id,
            pid
        );

        let shared = Arc::new(Shared {
            session_id: Mutex::new(command.session_id),
            writer: Mutex::new(writer),
            listeners: Mutex::new(Listeners::default()),
            events: MessageQueue::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let marker = command.id_marker;
        thread::Builder::new()
            .name(format!("pty-{}", command.binary))
            .spawn(move || pump_output(reader, child, thread_shared, marker))
            .map_err(|e| ProviderError::Pty(format!("Failed to start reader thread: {}", e)))?;

        Ok(Self {
            shared,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            pid,
        })
    }

    /// Current session id. May change once if the backend reveals its own.
    pub fn session_id(&self) -> String {
        self.shared.session_id.lock().unwrap().clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write raw bytes (keystrokes) to the terminal.
    pub fn write(&self, data: &[u8]) -> Result<(), ProviderError> {
        self.shared.write(data)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ProviderError> {
        self.master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProviderError::Pty(format!("Resize failed: {}", e)))
    }

    /// Kill the process immediately.
    pub fn kill(&self) {
        if let Err(e) = self.killer.lock().unwrap().kill() {
            log::debug!("Kill of pid {:?} failed: {}", self.pid, e);
        }
    }

    /// Register a callback for every output chunk.
    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.shared.listeners.lock().unwrap().data.push(Box::new(callback));
    }

    /// Register a callback for process exit. Runs immediately if the process
    /// already exited.
    pub fn on_exit<F>(&self, callback: F)
    where
        F: Fn(&AgentExit) + Send + Sync + 'static,
    {
        let mut listeners = self.shared.listeners.lock().unwrap();
        match &listeners.exited {
            Some(exit) => callback(exit),
            None => listeners.exit.push(Box::new(callback)),
        }
    }

    /// Every chunk and the final exit, queued. The queue closes after the
    /// exit event.
    pub fn events(&self) -> &MessageQueue<PtyEvent> {
        &self.shared.events
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        if self.shared.listeners.lock().unwrap().exited.is_none() {
            self.kill();
        }
    }
}

/// Reader thread body: runs until the PTY closes, then reaps the child.
fn pump_output(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    shared: Arc<Shared>,
    marker: Option<Regex>,
) {
    let mut probes = ProbeDetector::default();
    let mut discovery = marker.map(IdScanner::new);
    let mut buf = [0u8; 4096];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];

                for _ in 0..probes.scan(chunk) {
                    if let Err(e) = shared.write(CURSOR_POSITION_REPLY) {
                        log::debug!("Failed to answer cursor query: {}", e);
                    }
                }

                let found = discovery.as_mut().and_then(|scanner| scanner.scan(chunk));
                if let Some(id) = found {
                    log::info!("Discovered session id {}", id);
                    *shared.session_id.lock().unwrap() = id;
                    discovery = None;
                }

                shared.emit_data(chunk);
            }
            // EIO once the child side closes
            Err(e) => {
                log::debug!("PTY read ended: {}", e);
                break;
            }
        }
    }

    let exit = match child.wait() {
        Ok(status) => AgentExit {
            code: status.exit_code() as i32,
            signal: None,
        },
        Err(e) => {
            log::warn!("Failed to wait for PTY child: {}", e);
            AgentExit { code: -1, signal: None }
        }
    };
    log::debug!("Interactive session exited with {:?}", exit);
    shared.emit_exit(exit);
}

/// Counts cursor position queries, including ones split across reads.
#[derive(Debug, Default)]
struct ProbeDetector {
    tail: Vec<u8>,
}

impl ProbeDetector {
    fn scan(&mut self, chunk: &[u8]) -> usize {
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);

        let count = window
            .windows(CURSOR_POSITION_QUERY.len())
            .filter(|w| *w == CURSOR_POSITION_QUERY)
            .count();

        // The tail is shorter than the query, so a match never lies wholly
        // inside it and nothing is counted twice.
        let keep = CURSOR_POSITION_QUERY.len() - 1;
        let start = window.len().saturating_sub(keep);
        self.tail = window.split_off(start);
        count
    }
}

/// Looks for a session id in a bounded window of recent output.
struct IdScanner {
    marker: Regex,
    window: Vec<u8>,
}

impl IdScanner {
    fn new(marker: Regex) -> Self {
        Self {
            marker,
            window: Vec::new(),
        }
    }

    fn scan(&mut self, chunk: &[u8]) -> Option<String> {
        self.window.extend_from_slice(chunk);
        if self.window.len() > ID_SCAN_WINDOW {
            let excess = self.window.len() - ID_SCAN_WINDOW;
            self.window.drain(..excess);
        }

        let text = String::from_utf8_lossy(&self.window);
        let captures = self.marker.captures(&text)?;
        captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str().to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_found_in_single_chunk() {
        let mut probes = ProbeDetector::default();
        assert_eq!(probes.scan(b"hello\x1b[6nworld"), 1);
        assert_eq!(probes.scan(b"nothing here"), 0);
    }

    #[test]
    fn probe_split_across_chunks() {
        let mut probes = ProbeDetector::default();
        assert_eq!(probes.scan(b"abc\x1b["), 0);
        assert_eq!(probes.scan(b"6n"), 1);

        assert_eq!(probes.scan(b"\x1b"), 0);
        assert_eq!(probes.scan(b"["), 0);
        assert_eq!(probes.scan(b"6"), 0);
        assert_eq!(probes.scan(b"n\x1b[6n"), 2);
    }

    #[test]
    fn probe_not_counted_twice() {
        let mut probes = ProbeDetector::default();
        assert_eq!(probes.scan(b"\x1b[6n"), 1);
        assert_eq!(probes.scan(b"x"), 0);
    }

    #[test]
    fn id_scanner_prefers_capture_group() {
        let mut scanner = IdScanner::new(Regex::new(r"session id: ([0-9a-f-]{36})").unwrap());
        assert_eq!(scanner.scan(b"booting...\r\nsession id: 0199a2b4-"), None);
        assert_eq!(
            scanner.scan(b"7c1e-7f00-9e0a-1234567890ab\r\n").as_deref(),
            Some("0199a2b4-7c1e-7f00-9e0a-1234567890ab")
        );
    }

    #[test]
    fn id_scanner_window_is_bounded() {
        let mut scanner = IdScanner::new(Regex::new(r"ses_[A-Za-z0-9]+").unwrap());
        scanner.scan(&vec![b'x'; ID_SCAN_WINDOW * 3]);
        assert_eq!(scanner.window.len(), ID_SCAN_WINDOW);
        assert_eq!(scanner.scan(b" ses_Abc123 ").as_deref(), Some("ses_Abc123"));
    }

    #[cfg(unix)]
    mod pty {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        fn write_script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("agent.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn command(script: &Path, marker: Option<&str>) -> InteractiveCommand {
            InteractiveCommand {
                binary: script.to_str().unwrap().to_string(),
                args: Vec::new(),
                session_id: "provisional".to_string(),
                id_marker: marker.map(|m| Regex::new(m).unwrap()),
            }
        }

        fn config() -> AgentProviderConfig {
            AgentProviderConfig::new().shell_prefix("/bin/sh -c")
        }

        /// Drain events until exit; returns all output and the exit.
        fn run_to_exit(session: &InteractiveSession) -> (Vec<u8>, AgentExit) {
            let mut output = Vec::new();
            while let Some(event) = session.events().blocking_recv() {
                match event {
                    PtyEvent::Data(data) => output.extend(data),
                    PtyEvent::Exit(exit) => return (output, exit),
                }
            }
            panic!("event queue closed without exit");
        }

        #[test]
        fn prompt_reaches_process_unmodified() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "printf '%s' \"$1\" > \"$0.out\"\n");
            let prompt = "it's \"quoted\" `whoami` $(id) ; rm -rf nothing\nsecond line";
            let options = InteractiveSpawnOptions::new(dir.path().to_str().unwrap())
                .initial_prompt(prompt);

            let session = InteractiveSession::spawn(command(&script, None), &config(), &options).unwrap();
            let (_, exit) = run_to_exit(&session);

            assert_eq!(exit.code, 0);
            let received = std::fs::read_to_string(dir.path().join("agent.sh.out")).unwrap();
            assert_eq!(received, prompt);
        }

        #[test]
        fn environment_and_cwd_reach_process() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "echo \"$GREETING|$WORKSPACE_ROOT|$(pwd)\"\n");
            let options = InteractiveSpawnOptions::new(dir.path().to_str().unwrap())
                .env("GREETING", "hi")
                .root_directory("/srv/root");

            let session = InteractiveSession::spawn(command(&script, None), &config(), &options).unwrap();
            let (output, _) = run_to_exit(&session);
            let output = String::from_utf8_lossy(&output);

            assert!(output.contains("hi|/srv/root|"));
            let cwd = dir.path().canonicalize().unwrap();
            assert!(output.contains(cwd.to_str().unwrap()));
        }

        #[test]
        fn discovers_session_id_from_output() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "echo 'ready'\necho 'session: ses_Zx81'\n");
            let options = InteractiveSpawnOptions::new(dir.path().to_str().unwrap());

            let session = InteractiveSession::spawn(
                command(&script, Some(r"ses_[A-Za-z0-9]+")),
                &config(),
                &options,
            )
            .unwrap();
            run_to_exit(&session);

            assert_eq!(session.session_id(), "ses_Zx81");
        }

        #[test]
        fn callbacks_and_exit_code() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "echo out\nexit 4\n");
            let options = InteractiveSpawnOptions::new(dir.path().to_str().unwrap());

            let session = InteractiveSession::spawn(command(&script, None), &config(), &options).unwrap();
            let bytes = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&bytes);
            session.on_data(move |chunk| {
                counter.fetch_add(chunk.len(), Ordering::SeqCst);
            });

            let (_, exit) = run_to_exit(&session);
            assert_eq!(exit.code, 4);
            assert_eq!(session.session_id(), "provisional");

            // Registered after the fact, still told about the exit.
            let (tx, rx) = std::sync::mpsc::channel();
            session.on_exit(move |exit| {
                let _ = tx.send(exit.code);
            });
            assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 4);
        }

        #[test]
        fn write_resize_and_kill() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "exec cat\n");
            let options = InteractiveSpawnOptions::new(dir.path().to_str().unwrap()).size(80, 24);

            let session = InteractiveSession::spawn(command(&script, None), &config(), &options).unwrap();
            session.resize(100, 30).unwrap();
            session.write(b"ping\r").unwrap();

            let mut seen = Vec::new();
            while !String::from_utf8_lossy(&seen).contains("ping") {
                match session.events().blocking_recv() {
                    Some(PtyEvent::Data(data)) => seen.extend(data),
                    other => panic!("unexpected event {:?}", other),
                }
            }

            session.kill();
            let (_, exit) = run_to_exit(&session);
            assert_ne!(exit.code, 0);
        }
    }
}
