//! PTY session lifecycle
//!
//! One pseudo-terminal with exactly one attached child process:
//! - A reader thread streams master output into a bounded channel
//! - A writer thread drains a bounded input channel into the master, so a
//!   shell that stops reading stdin never blocks an async task
//! - A reaper thread waits on the child and escalates termination on close
//! - `close` is idempotent and never waits on an in-flight write

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Variables forced onto every shell; the client is an xterm-compatible
/// web terminal
pub const TERMINAL_ENV: &[(&str, &str)] = &[
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("COLORFGBG", "15;0"),
];

/// Upper bound on a single `read` so callers can observe cancellation
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK_SIZE: usize = 4096;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("Invalid session name: {0:?}")]
    InvalidSessionName(String),

    #[error("Process already exited")]
    ProcessExited,

    #[error("PTY session closed")]
    Closed,

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Convert to portable-pty PtySize
    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Outcome of a single read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyRead {
    /// Bytes produced by the shell
    Data(Vec<u8>),
    /// Nothing arrived within the poll interval
    Idle,
    /// The process side of the PTY is gone
    Eof,
}

/// Record of how the child process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// The session ID
    pub id: Uuid,
    /// Exit code if available
    pub exit_code: Option<u32>,
    /// Exit reason
    pub reason: ExitReason,
}

/// Reason for process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Process exited on its own
    Normal,
    /// Process was terminated by `close`
    Killed,
    /// Waiting on the process failed
    Unknown,
}

/// A pseudo-terminal with one attached child process
pub struct PtySession {
    id: Uuid,
    program: String,
    working_dir: PathBuf,
    size: TerminalSize,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    input_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    kill_requested: Arc<AtomicBool>,
    closed: AtomicBool,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl PtySession {
    /// Spawn `program` with `args` attached to a new PTY
    ///
    /// `env` is applied on top of the inherited environment, then
    /// [`TERMINAL_ENV`] on top of that. Creation is atomic: if any step after
    /// the spawn fails, the child is killed and reaped before returning.
    pub fn spawn(
        program: &str,
        args: &[String],
        working_dir: &Path,
        env: &HashMap<String, String>,
        size: TerminalSize,
    ) -> PtyResult<Self> {
        let id = Uuid::new_v4();

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(working_dir);
        for (key, value) in env {
            cmd.env(key, value);
        }
        for (key, value) in TERMINAL_ENV {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("{program}: {e}")))?;

        // The child holds its own copy of the slave side
        drop(pair.slave);

        let handles = pair
            .master
            .try_clone_reader()
            .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PtyError::SystemError(e.to_string()));
            }
        };

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_requested = Arc::new(AtomicBool::new(false));

        std::thread::spawn(move || Self::reader_loop(reader, output_tx, id));
        std::thread::spawn(move || Self::writer_loop(writer, input_rx, id));

        let reaper_kill = Arc::clone(&kill_requested);
        std::thread::spawn(move || Self::reap_loop(child, reaper_kill, exit_tx, id));

        debug!("PTY {} spawned {} in {}", id, program, working_dir.display());

        Ok(Self {
            id,
            program: program.to_string(),
            working_dir: working_dir.to_path_buf(),
            size,
            master: Mutex::new(Some(pair.master)),
            input_tx: Mutex::new(Some(input_tx)),
            output_rx: AsyncMutex::new(output_rx),
            kill_requested,
            closed: AtomicBool::new(false),
            exit_rx,
        })
    }

    /// Reader loop that runs in a separate thread
    ///
    /// Ends on EOF, on a read error (Linux reports EIO once the child side is
    /// gone), or when the session drops its receiver.
    fn reader_loop(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>, id: Uuid) {
        let mut buffer = [0u8; READ_CHUNK_SIZE];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("PTY {} reached end of stream", id);
                    break;
                }
                Ok(n) => {
                    if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    debug!("PTY {} read ended: {}", id, e);
                    break;
                }
            }
        }
    }

    /// Writer loop that runs in a separate thread
    ///
    /// Ends when every input sender is gone or the master stops accepting
    /// writes (EIO once the child side is closed).
    fn writer_loop(
        mut writer: Box<dyn Write + Send>,
        mut input_rx: mpsc::Receiver<Vec<u8>>,
        id: Uuid,
    ) {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                debug!("PTY {} write ended: {}", id, e);
                break;
            }
        }
    }

    /// Reaper loop that runs in a separate thread
    fn reap_loop(
        mut child: Box<dyn Child + Send + Sync>,
        kill_requested: Arc<AtomicBool>,
        exit_tx: watch::Sender<Option<ProcessExit>>,
        id: Uuid,
    ) {
        let exit = loop {
            if kill_requested.load(Ordering::SeqCst) {
                // Exited on its own before the kill request was seen
                if let Ok(Some(status)) = child.try_wait() {
                    break ProcessExit {
                        id,
                        exit_code: Some(status.exit_code()),
                        reason: ExitReason::Normal,
                    };
                }
                // SIGHUP first, SIGKILL if the child ignores it
                if let Err(e) = child.kill() {
                    debug!("PTY {} kill: {}", id, e);
                }
                break match child.wait() {
                    Ok(status) => ProcessExit {
                        id,
                        exit_code: Some(status.exit_code()),
                        reason: ExitReason::Killed,
                    },
                    Err(e) => {
                        warn!("PTY {} wait after kill failed: {}", id, e);
                        ProcessExit {
                            id,
                            exit_code: None,
                            reason: ExitReason::Unknown,
                        }
                    }
                };
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    break ProcessExit {
                        id,
                        exit_code: Some(status.exit_code()),
                        reason: ExitReason::Normal,
                    };
                }
                Ok(None) => std::thread::sleep(REAP_POLL_INTERVAL),
                Err(e) => {
                    warn!("PTY {} wait failed: {}", id, e);
                    break ProcessExit {
                        id,
                        exit_code: None,
                        reason: ExitReason::Unknown,
                    };
                }
            }
        };

        debug!("PTY {} child exited: {:?}", id, exit);
        let _ = exit_tx.send(Some(exit));
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the program attached to the PTY
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Get the working directory the program started in
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Get the terminal size
    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Check if `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Check if the child process has been reaped
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait until the child process has been reaped
    pub async fn wait_exit(&self) -> Option<ProcessExit> {
        let mut exit_rx = self.exit_rx.clone();
        let exit = exit_rx.wait_for(Option::is_some).await.ok()?;
        exit.clone()
    }

    /// Read the next chunk of output
    ///
    /// Waits at most [`READ_POLL_INTERVAL`]; `Idle` means nothing arrived in
    /// that window. Buffered output is still delivered after the child exits,
    /// followed by `Eof`.
    pub async fn read(&self) -> PtyResult<PtyRead> {
        if self.is_closed() {
            return Err(PtyError::Closed);
        }

        let mut output_rx = self.output_rx.lock().await;
        match tokio::time::timeout(READ_POLL_INTERVAL, output_rx.recv()).await {
            Ok(Some(data)) => Ok(PtyRead::Data(data)),
            Ok(None) => Ok(PtyRead::Eof),
            Err(_) => Ok(PtyRead::Idle),
        }
    }

    /// Queue input for the PTY
    ///
    /// Waits only for room in the input channel, never on the terminal
    /// itself, so the future can always be dropped. A failed terminal write
    /// surfaces as `WriteFailed` on the next call.
    pub async fn write(&self, data: &[u8]) -> PtyResult<()> {
        if self.is_closed() {
            return Err(PtyError::Closed);
        }
        if self.has_exited() {
            return Err(PtyError::ProcessExited);
        }

        let input_tx = self
            .input_tx
            .lock()
            .map_err(|_| PtyError::WriteFailed("input lock poisoned".into()))?
            .as_ref()
            .cloned()
            .ok_or(PtyError::Closed)?;

        input_tx
            .send(data.to_vec())
            .await
            .map_err(|_| PtyError::WriteFailed("PTY no longer accepts input".into()))
    }

    /// Release the PTY and terminate the child
    ///
    /// Idempotent. Dropping the input sender stops the writer thread once
    /// queued input is flushed or the terminal rejects it.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.kill_requested.store(true, Ordering::SeqCst);

        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
        if let Ok(mut input_tx) = self.input_tx.lock() {
            input_tx.take();
        }

        debug!("PTY {} closed", self.id);
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.close();
    }
}
