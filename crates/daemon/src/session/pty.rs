//! PTY session management.
//!
//! A [`PtySession`] owns one pseudo-terminal and the shell process attached
//! to it. Output is read on a dedicated OS thread and delivered in order
//! through a bounded channel; only one [`OutputStream`] may hold that
//! channel at a time. Input and resizes go straight to the PTY master.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::TerminalSize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::{lock, SessionId};
use crate::config::SessionConfig;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to spawn the PTY or the shell.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Requested terminal size is out of range.
    #[error("invalid terminal size {rows}x{cols}: rows and cols must be between 1 and 65535")]
    InvalidSize { rows: i64, cols: i64 },

    /// The session is closing or closed.
    #[error("session closed: {0}")]
    Closed(SessionId),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Another reader already holds the output stream.
    #[error("output stream for session {0} is already in use")]
    OutputBusy(SessionId),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Starting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// True once the session can no longer accept input.
    pub fn is_ending(self) -> bool {
        self >= SessionState::Closing
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Default number of output chunks buffered while nobody is reading.
pub const DEFAULT_OUTPUT_BUFFER: usize = 256;

/// The program started inside each PTY, with its environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub term: String,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            term: "xterm-256color".to_string(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            program: config.shell.clone(),
            args: config.args.clone(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cwd: config.cwd.clone(),
            term: config.term.clone(),
        }
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref dir) = self.cwd {
            cmd.cwd(dir);
        }

        cmd.env("TERM", &self.term);
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }
}

/// A PTY session with a shell process.
pub struct PtySession {
    id: SessionId,

    /// The PTY master. Released on close.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// Input side of the PTY. Shared with the blocking pool for writes.
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,

    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,

    /// Output chunks from the reader thread.
    output: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,

    state: Arc<AtomicU8>,
    size: Mutex<TerminalSize>,
    created_at: SystemTime,

    /// Unix millis of the last input or output.
    last_activity: Arc<AtomicU64>,

    pid: Option<u32>,
    exit_code: Mutex<Option<u32>>,

    /// Set by the first call to `close`.
    reclaimed: AtomicBool,

    /// Cancelled once the session is Closed.
    closed: CancellationToken,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}

impl PtySession {
    /// Spawns a new PTY session running `command` at the given size.
    pub fn spawn(
        id: SessionId,
        command: &ShellCommand,
        size: TerminalSize,
    ) -> Result<Self, SessionError> {
        Self::spawn_with_buffer(id, command, size, DEFAULT_OUTPUT_BUFFER)
    }

    /// Like [`spawn`](Self::spawn) with an explicit output buffer capacity
    /// in chunks.
    pub fn spawn_with_buffer(
        id: SessionId,
        command: &ShellCommand,
        size: TerminalSize,
        output_buffer: usize,
    ) -> Result<Self, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(command.to_builder())
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", command.program, e)))?;

        // The slave must close in this process or reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();

        let io = pair.master.try_clone_reader().and_then(|reader| {
            let writer = pair.master.take_writer()?;
            Ok((reader, writer))
        });
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                reap_abandoned(&mut *child);
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        let (output_tx, output_rx) = mpsc::channel(output_buffer.max(1));

        let session = PtySession {
            id,
            master: Mutex::new(Some(pair.master)),
            writer: Arc::new(Mutex::new(Some(writer))),
            child: Arc::new(Mutex::new(child)),
            output: Arc::new(tokio::sync::Mutex::new(output_rx)),
            state: Arc::new(AtomicU8::new(SessionState::Starting as u8)),
            size: Mutex::new(size),
            created_at: SystemTime::now(),
            last_activity: Arc::new(AtomicU64::new(now_millis())),
            pid,
            exit_code: Mutex::new(None),
            reclaimed: AtomicBool::new(false),
            closed: CancellationToken::new(),
        };

        if let Err(e) = session.start_reader(reader, output_tx) {
            reap_abandoned(&mut **lock(&session.child));
            return Err(e);
        }
        session.advance(SessionState::Active);

        tracing::info!(
            session_id = %session.id,
            pid = ?pid,
            program = %command.program,
            cols = size.cols,
            rows = size.rows,
            "Spawned PTY session"
        );

        Ok(session)
    }

    /// Spawns the blocking reader thread feeding the output channel.
    ///
    /// The thread ends at EOF, on a read error, or once the receiving side
    /// is dropped. Ending moves the session to Closing and closes the
    /// channel so the current stream holder sees the end of output.
    fn start_reader(
        &self,
        mut reader: Box<dyn Read + Send>,
        output_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), SessionError> {
        let state = Arc::clone(&self.state);
        let last_activity = Arc::clone(&self.last_activity);
        let session_id = self.id.clone();

        std::thread::Builder::new()
            .name(format!("pty-reader-{}", self.id.short()))
            .spawn(move || {
                let mut buffer = [0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            tracing::info!(session_id = %session_id, "PTY EOF - process exited");
                            break;
                        }
                        Ok(n) => {
                            last_activity.store(now_millis(), Ordering::Relaxed);
                            if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                                tracing::debug!(session_id = %session_id, "Output receiver dropped");
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // Linux reports EIO once the child side of the PTY is gone.
                            if SessionState::from_u8(state.load(Ordering::SeqCst)).is_ending() {
                                tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                            } else {
                                tracing::info!(session_id = %session_id, error = %e, "PTY closed - process exited");
                            }
                            break;
                        }
                    }
                }
                state.fetch_max(SessionState::Closing as u8, Ordering::SeqCst);
            })
            .map(|_| ())
            .map_err(|e| SessionError::SpawnFailed(format!("failed to start reader thread: {e}")))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move the state forward to `to`. Returns the previous state.
    ///
    /// Requests to move backwards leave the state unchanged.
    fn advance(&self, to: SessionState) -> SessionState {
        SessionState::from_u8(self.state.fetch_max(to as u8, Ordering::SeqCst))
    }

    /// Last size applied through [`resize`](Self::resize) or at spawn.
    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Unix millis of the last input or output.
    pub fn last_activity_millis(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Time since the last input or output.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_activity_millis()))
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Exit code of the shell, once it has been reaped.
    pub fn exit_code(&self) -> Option<u32> {
        *lock(&self.exit_code)
    }

    /// Writes data to the PTY (stdin).
    ///
    /// The write runs on the blocking pool; callers that await each write
    /// before issuing the next get their bytes to the PTY in order.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.state().is_ending() {
            return Err(SessionError::Closed(self.id.clone()));
        }

        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = lock(&writer);
            let writer = guard.as_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "PTY writer released")
            })?;
            writer.write_all(&data)?;
            writer.flush()
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.id, error = %e, "PTY write failed");
                self.advance(SessionState::Closing);
                Err(SessionError::WriteFailed(e.to_string()))
            }
            Err(e) => Err(SessionError::WriteFailed(e.to_string())),
        }
    }

    /// Resizes the PTY.
    ///
    /// Dimensions are validated before anything is touched; a rejected
    /// request leaves the terminal geometry unchanged.
    pub fn resize(&self, rows: i64, cols: i64) -> Result<TerminalSize, SessionError> {
        let size =
            TerminalSize::new(rows, cols).map_err(|_| SessionError::InvalidSize { rows, cols })?;

        if self.state().is_ending() {
            return Err(SessionError::Closed(self.id.clone()));
        }

        {
            let master = lock(&self.master);
            let master = master
                .as_ref()
                .ok_or_else(|| SessionError::Closed(self.id.clone()))?;
            master
                .resize(pty_size(size))
                .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;
        }
        *lock(&self.size) = size;

        tracing::debug!(
            session_id = %self.id,
            cols = size.cols,
            rows = size.rows,
            "Resized PTY"
        );

        Ok(size)
    }

    /// Queries the kernel for the current PTY geometry.
    pub fn pty_size(&self) -> Result<TerminalSize, SessionError> {
        let master = lock(&self.master);
        let master = master
            .as_ref()
            .ok_or_else(|| SessionError::Closed(self.id.clone()))?;
        let size = master
            .get_size()
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;
        Ok(TerminalSize {
            rows: size.rows,
            cols: size.cols,
        })
    }

    /// Takes the output stream.
    ///
    /// Fails with [`SessionError::OutputBusy`] while another stream is held.
    /// Dropping a stream releases it; the next holder continues from the
    /// first chunk the previous holder did not consume.
    pub fn read(&self) -> Result<OutputStream, SessionError> {
        let receiver = Arc::clone(&self.output)
            .try_lock_owned()
            .map_err(|_| SessionError::OutputBusy(self.id.clone()))?;
        Ok(OutputStream {
            receiver,
            last_activity: Arc::clone(&self.last_activity),
        })
    }

    /// Non-blocking check whether the shell has exited.
    pub fn try_wait(&self) -> Result<Option<u32>, SessionError> {
        let mut child = lock(&self.child);
        match child.try_wait()? {
            Some(status) => {
                let code = status.exit_code();
                *lock(&self.exit_code) = Some(code);
                self.advance(SessionState::Closing);
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Terminates the shell and releases the PTY.
    ///
    /// The shell's process group gets SIGHUP first, then the shell itself is
    /// killed and reaped. Calling `close` again is a no-op.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.reclaimed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.advance(SessionState::Closing);

        let child = Arc::clone(&self.child);
        let session_id = self.id.clone();
        let reaped = tokio::task::spawn_blocking(move || {
            let mut child = lock(&child);
            if let Ok(Some(status)) = child.try_wait() {
                return Some(status.exit_code());
            }

            if let Some(pid) = child.process_id() {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                    tracing::debug!(session_id = %session_id, error = %e, "killpg failed");
                }
            }
            if let Err(e) = child.kill() {
                tracing::debug!(session_id = %session_id, error = %e, "kill failed");
            }
            child.wait().ok().map(|status| status.exit_code())
        })
        .await;

        let code = match reaped {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Reaping task failed");
                None
            }
        };
        if code.is_some() {
            *lock(&self.exit_code) = code;
        }

        // Dropping the master and writer releases the PTY descriptors.
        lock(&self.writer).take();
        lock(&self.master).take();

        self.advance(SessionState::Closed);
        self.closed.cancel();

        tracing::info!(
            session_id = %self.id,
            exit_code = ?code,
            "Session closed"
        );

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

/// Exclusive handle on a session's output.
///
/// Yields chunks in the order they were read from the PTY and ends when
/// the reader thread stops.
pub struct OutputStream {
    receiver: OwnedMutexGuard<mpsc::Receiver<Vec<u8>>>,
    last_activity: Arc<AtomicU64>,
}

impl OutputStream {
    /// Next chunk of output, or `None` once the PTY has closed.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        let chunk = self.receiver.recv().await;
        if chunk.is_some() {
            self.last_activity.store(now_millis(), Ordering::Relaxed);
        }
        chunk
    }

    /// Chunks already buffered, without waiting for more.
    pub fn drain_ready(&mut self) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.receiver.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }
}

/// Kill and reap a shell whose session could not be set up.
fn reap_abandoned(child: &mut (dyn Child + Send + Sync)) {
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "Failed to kill abandoned shell");
    }
    if let Err(e) = child.wait() {
        tracing::debug!(error = %e, "Failed to reap abandoned shell");
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Returns the current time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn spawn_sh() -> PtySession {
        PtySession::spawn(
            SessionId::generate(),
            &ShellCommand::new("/bin/sh"),
            TerminalSize::default(),
        )
        .unwrap()
    }

    /// Read output until `marker` shows up or the stream ends.
    async fn read_until(output: &mut OutputStream, marker: &str) -> String {
        let mut collected = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), output.next()).await {
                Ok(Some(data)) => {
                    collected.push_str(&String::from_utf8_lossy(&data));
                    if collected.contains(marker) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        collected
    }

    #[test]
    fn test_state_ordering() {
        assert!(SessionState::Starting < SessionState::Active);
        assert!(SessionState::Active < SessionState::Closing);
        assert!(SessionState::Closing < SessionState::Closed);
        assert!(!SessionState::Active.is_ending());
        assert!(SessionState::Closing.is_ending());
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_shell_command_builder() {
        let cmd = ShellCommand::new("tmux")
            .arg("new-session")
            .arg("-A")
            .env("LANG", "C.UTF-8")
            .cwd("/tmp");
        assert_eq!(cmd.program, "tmux");
        assert_eq!(cmd.args, vec!["new-session", "-A"]);
        assert_eq!(cmd.env, vec![("LANG".to_string(), "C.UTF-8".to_string())]);
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(cmd.term, "xterm-256color");
    }

    #[test]
    fn test_shell_command_from_config() {
        let mut config = SessionConfig::default();
        config.shell = "/bin/bash".to_string();
        config.args = vec!["-l".to_string()];
        config.env.insert("FOO".to_string(), "bar".to_string());

        let cmd = ShellCommand::from_config(&config);
        assert_eq!(cmd.program, "/bin/bash");
        assert_eq!(cmd.args, vec!["-l"]);
        assert_eq!(cmd.env, vec![("FOO".to_string(), "bar".to_string())]);
    }

    #[tokio::test]
    async fn test_session_spawn() {
        let session = spawn_sh();

        assert_eq!(session.state(), SessionState::Active);
        assert!(session.pid().is_some());
        assert_eq!(session.size(), TerminalSize::default());
        assert_eq!(session.pty_size().unwrap(), TerminalSize::default());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = PtySession::spawn(
            SessionId::generate(),
            &ShellCommand::new("/nonexistent/shell"),
            TerminalSize::default(),
        );
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[test]
    fn test_reap_abandoned_shell() {
        let pair = native_pty_system()
            .openpty(pty_size(TerminalSize::default()))
            .unwrap();
        let mut child = pair
            .slave
            .spawn_command(ShellCommand::new("sleep").arg("100").to_builder())
            .unwrap();
        let pid = Pid::from_raw(child.process_id().unwrap() as i32);

        reap_abandoned(&mut *child);

        assert!(child.try_wait().unwrap().is_some());
        assert_eq!(
            nix::sys::signal::kill(pid, None),
            Err(nix::errno::Errno::ESRCH)
        );
    }

    #[tokio::test]
    async fn test_session_output() {
        let session = spawn_sh();
        let mut output = session.read().unwrap();

        session.write(b"echo test_output_$((6*7))\n").await.unwrap();

        let text = read_until(&mut output, "test_output_42").await;
        assert!(text.contains("test_output_42"), "got: {text:?}");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_env_vars() {
        let command = ShellCommand::new("/bin/sh").env("WEBTERM_TEST_VAR", "test_value");
        let session =
            PtySession::spawn(SessionId::generate(), &command, TerminalSize::default()).unwrap();
        let mut output = session.read().unwrap();

        session
            .write(b"echo \"$WEBTERM_TEST_VAR:$TERM:$COLORTERM\"\n")
            .await
            .unwrap();

        let text = read_until(&mut output, "test_value:xterm-256color:truecolor").await;
        assert!(text.contains("test_value:xterm-256color:truecolor"), "got: {text:?}");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_arrive_in_order() {
        let session = spawn_sh();
        let mut output = session.read().unwrap();

        session.write(b"echo ord").await.unwrap();
        session.write(b"er_$((1+").await.unwrap();
        session.write(b"1))_done\n").await.unwrap();

        let text = read_until(&mut output, "order_2_done").await;
        assert!(text.contains("order_2_done"), "got: {text:?}");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_updates_pty() {
        let session = spawn_sh();

        let size = session.resize(40, 120).unwrap();
        assert_eq!(size, TerminalSize { rows: 40, cols: 120 });
        assert_eq!(session.size(), size);
        assert_eq!(session.pty_size().unwrap(), size);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_rejects_non_positive() {
        let session = spawn_sh();

        for (rows, cols) in [(0, 80), (24, 0), (-1, 80), (24, -10), (70000, 80)] {
            let result = session.resize(rows, cols);
            assert!(
                matches!(result, Err(SessionError::InvalidSize { .. })),
                "{rows}x{cols} should be rejected"
            );
        }
        assert_eq!(session.size(), TerminalSize::default());
        assert_eq!(session.pty_size().unwrap(), TerminalSize::default());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_output_stream_is_exclusive() {
        let session = spawn_sh();

        let first = session.read().unwrap();
        assert!(matches!(session.read(), Err(SessionError::OutputBusy(_))));

        drop(first);
        assert!(session.read().is_ok());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_output_continues_after_handover() {
        let session = spawn_sh();

        {
            let mut first = session.read().unwrap();
            session.write(b"echo first_marker\n").await.unwrap();
            let text = read_until(&mut first, "first_marker").await;
            assert!(text.contains("first_marker"));
        }

        let mut second = session.read().unwrap();
        session.write(b"echo second_marker\n").await.unwrap();
        let text = read_until(&mut second, "second_marker").await;
        assert!(text.contains("second_marker"));

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_child_exit_ends_output() {
        let session = spawn_sh();
        let mut output = session.read().unwrap();

        session.write(b"exit 3\n").await.unwrap();

        let ended = timeout(Duration::from_secs(5), async {
            while output.next().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "output stream did not end after exit");
        assert!(session.state().is_ending());

        let mut code = None;
        for _ in 0..50 {
            code = session.try_wait().unwrap();
            if code.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(code, Some(3));

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = spawn_sh();

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_closed());

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_signals_waiters() {
        let session = Arc::new(spawn_sh());
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.closed().await })
        };

        session.close().await.unwrap();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed signal not delivered")
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_after_close() {
        let session = spawn_sh();
        session.close().await.unwrap();

        let result = session.write(b"hello\n").await;
        assert!(matches!(result, Err(SessionError::Closed(_))));
    }

    #[tokio::test]
    async fn test_resize_after_close() {
        let session = spawn_sh();
        session.close().await.unwrap();

        assert!(matches!(session.resize(50, 100), Err(SessionError::Closed(_))));
        assert!(session.pty_size().is_err());
    }

    #[tokio::test]
    async fn test_state_never_moves_backwards() {
        let session = spawn_sh();
        session.close().await.unwrap();

        assert_eq!(session.advance(SessionState::Active), SessionState::Closed);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_activity_tracking() {
        let session = spawn_sh();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let before = session.last_activity_millis();
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.write(b"\n").await.unwrap();
        assert!(session.last_activity_millis() > before);
        assert!(session.idle_for() < Duration::from_secs(1));

        session.close().await.unwrap();
    }
}
