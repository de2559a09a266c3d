//! Session bridge
//!
//! Multiplexes one WebSocket connection against one PTY session:
//! validate → substitute → spawn → pump both ways → tear everything down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pump;
use crate::command::{self, CommandPolicy, PolicyViolation};
use crate::config::ServiceConfig;
use crate::pty::{
    ensure_multiplexer_session, ProcessExit, PtyError, PtySession, ShellLaunch, TerminalSize,
};

/// Extra wait before typing into a freshly attached multiplexer session
const MULTIPLEXER_SETTLE: Duration = Duration::from_millis(100);

/// How long teardown waits for the second pump before aborting it
const PUMP_JOIN_GRACE: Duration = Duration::from_secs(2);

/// How long teardown waits for the child to be reaped
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Errors that prevent a session from being established
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),

    #[error("Failed to start shell: {0}")]
    Spawn(#[from] PtyError),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Why an established session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The shell exited or its PTY reached end of stream
    ProcessEnded,
    /// The client sent a close frame or disconnected cleanly
    ClientClosed,
    /// Connection read/write failed or hit the write deadline
    Transport(String),
    /// PTY read/write failed
    Pty(String),
    /// The server is shutting down
    Shutdown,
    /// A pump task panicked or was aborted
    TaskFailed(String),
}

/// What a finished session reports to its caller
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub end: SessionEnd,
    /// Exit record of the shell; `None` if it was not reaped within the grace
    /// period
    pub exit: Option<ProcessExit>,
}

/// Per-instance bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub shell_program: String,
    pub shell_args: Vec<String>,
    pub working_dir: PathBuf,
    pub size: TerminalSize,
    /// Upper bound on the wait for the shell's first output before the
    /// startup command is written
    pub startup_delay: Duration,
    /// Deadline for a single outbound frame
    pub write_timeout: Duration,
    pub policy: CommandPolicy,
}

impl BridgeSettings {
    /// Build settings from the service configuration
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            shell_program: config.shell.program.clone(),
            shell_args: config.shell.args.clone(),
            working_dir: command::workspace_dir(config.shell.working_dir.as_deref()),
            size: TerminalSize::new(config.shell.cols, config.shell.rows),
            startup_delay: Duration::from_millis(config.shell.startup_delay_ms),
            write_timeout: Duration::from_secs(config.websocket.write_timeout_secs),
            policy: config.policy.command_policy(),
        }
    }
}

/// What the client asked for when opening the shell
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShellRequest {
    /// Command typed into the shell once it is ready
    pub command: Option<String>,
    /// Substituted into `command` and exported to the shell
    pub variables: HashMap<String, String>,
    /// Attach to this named multiplexer session instead of a fresh shell
    pub session_name: Option<String>,
}

#[cfg(test)]
impl ShellRequest {
    /// Set the startup command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Set the variables
    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    /// Set the named session
    pub fn with_session(mut self, session_name: impl Into<String>) -> Self {
        self.session_name = Some(session_name.into());
        self
    }
}

/// A spawned session waiting for its pumps
struct Established {
    session: Arc<PtySession>,
    command: Option<String>,
    settle: Duration,
}

/// Bridges one WebSocket connection to one PTY session
pub struct SessionBridge {
    settings: Arc<BridgeSettings>,
}

impl SessionBridge {
    /// Create a bridge
    pub fn new(settings: Arc<BridgeSettings>) -> Self {
        Self { settings }
    }

    /// Validate and substitute the startup command
    ///
    /// The command is checked before and after substitution. Returns `None`
    /// when there is nothing to type into the shell.
    pub fn resolve_command(&self, request: &ShellRequest) -> BridgeResult<Option<String>> {
        let Some(raw) = request.command.as_deref().filter(|c| !c.is_empty()) else {
            return Ok(None);
        };

        self.settings.policy.check(raw)?;
        let command = command::substitute(raw, &request.variables);
        self.settings.policy.check(&command)?;

        Ok(Some(command).filter(|c| !c.is_empty()))
    }

    /// Run a session to completion
    ///
    /// Establishment failures (`PolicyViolation`, `Spawn`) close the
    /// connection and are returned before any pump starts. Everything after
    /// that ends the session normally and is reported in the summary.
    pub async fn run<S>(
        &self,
        mut ws: WebSocketStream<S>,
        request: ShellRequest,
        shutdown: broadcast::Receiver<()>,
    ) -> BridgeResult<SessionSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Established {
            session,
            command,
            settle,
        } = match self.establish(&request).await {
            Ok(established) => established,
            Err(e) => {
                warn!("Shell session not started: {}", e);
                let _ = timeout(self.settings.write_timeout, ws.close(None)).await;
                return Err(e);
            }
        };

        let session_id = session.id();
        let write_timeout = self.settings.write_timeout;
        let (sink, stream) = ws.split();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let mut outbound = tokio::spawn(pump::forward_output(
            Arc::clone(&session),
            sink,
            write_timeout,
            cancel_rx.clone(),
            ready_tx,
        ));
        let mut inbound = tokio::spawn(pump::forward_input(
            Arc::clone(&session),
            stream,
            cancel_rx.clone(),
        ));
        let injector = command.map(|command| {
            tokio::spawn(pump::inject_startup(
                Arc::clone(&session),
                command,
                ready_rx,
                self.settings.startup_delay,
                settle,
                cancel_rx,
            ))
        });

        enum First<A, B> {
            Outbound(Result<A, JoinError>),
            Inbound(Result<B, JoinError>),
            Shutdown,
        }

        let first = tokio::select! {
            result = &mut outbound => First::Outbound(result),
            result = &mut inbound => First::Inbound(result),
            _ = shutdown_requested(shutdown) => First::Shutdown,
        };

        // Teardown: stop both pumps, release the PTY, then collect the
        // pump that is still running
        let _ = cancel_tx.send(true);
        session.close();
        if let Some(injector) = injector {
            injector.abort();
        }

        let (outbound_result, end) = match first {
            First::Outbound(result) => {
                let end = pump_end(result.as_ref().map(|(_, end)| end.clone()));
                join_bounded(&mut inbound).await;
                (Some(result), end)
            }
            First::Inbound(result) => {
                let end = pump_end(result.as_ref().map(Clone::clone));
                (join_bounded(&mut outbound).await, end)
            }
            First::Shutdown => {
                info!("Session {}: server shutting down", session_id);
                let outbound_result = join_bounded(&mut outbound).await;
                join_bounded(&mut inbound).await;
                (outbound_result, SessionEnd::Shutdown)
            }
        };

        if let Some(Ok((mut sink, _))) = outbound_result {
            if timeout(write_timeout, sink.close()).await.is_err() {
                debug!("Session {}: close frame not delivered", session_id);
            }
        }

        let exit = timeout(EXIT_GRACE, session.wait_exit()).await.ok().flatten();
        match &exit {
            Some(exit) => info!(
                "Session {} ended ({:?}); shell exit {:?} code {:?}",
                session_id, end, exit.reason, exit.exit_code
            ),
            None => warn!(
                "Session {} ended ({:?}); shell not reaped within {:?}",
                session_id, end, EXIT_GRACE
            ),
        }

        Ok(SessionSummary {
            session_id,
            end,
            exit,
        })
    }

    /// Policy check, launch selection and spawn
    async fn establish(&self, request: &ShellRequest) -> BridgeResult<Established> {
        let command = self.resolve_command(request)?;
        let env = command::command_overrides(&request.variables);

        let launch = match request.session_name.as_deref() {
            Some(name) => {
                let launch = ShellLaunch::attach(name)?;
                ensure_multiplexer_session(name, &self.settings.working_dir, &env)
                    .await?;
                launch
            }
            None => ShellLaunch::shell(&self.settings.shell_program, &self.settings.shell_args),
        };

        let session = PtySession::spawn(
            &launch.program,
            &launch.args,
            &self.settings.working_dir,
            &env,
            self.settings.size,
        )?;

        info!(
            "Session {} started {} {:?} in {} ({}x{}, {} variables)",
            session.id(),
            session.program(),
            launch.args,
            session.working_dir().display(),
            session.size().cols,
            session.size().rows,
            request.variables.len()
        );

        let settle = if launch.is_multiplexed() {
            MULTIPLEXER_SETTLE
        } else {
            Duration::ZERO
        };

        Ok(Established {
            session: Arc::new(session),
            command,
            settle,
        })
    }
}

/// Resolves when the server broadcasts shutdown; never resolves if the
/// server side of the channel is gone
async fn shutdown_requested(mut shutdown: broadcast::Receiver<()>) {
    match shutdown.recv().await {
        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
    }
}

fn pump_end(result: Result<Option<SessionEnd>, &JoinError>) -> SessionEnd {
    match result {
        Ok(Some(end)) => end,
        // The first pump to finish was not cancelled, so `None` only shows
        // up if cancellation raced it
        Ok(None) => SessionEnd::Shutdown,
        Err(e) => SessionEnd::TaskFailed(e.to_string()),
    }
}

/// Wait for a pump that has been cancelled, aborting it if it lingers
async fn join_bounded<T>(handle: &mut JoinHandle<T>) -> Option<Result<T, JoinError>> {
    match timeout(PUMP_JOIN_GRACE, &mut *handle).await {
        Ok(result) => Some(result),
        Err(_) => {
            warn!("Pump did not stop within {:?}; aborting", PUMP_JOIN_GRACE);
            handle.abort();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec;
    use crate::command::DEFAULT_BLOCKED_COMMANDS;
    use crate::pty::ExitReason;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, client_async};

    const READY_AND_ECHO: &str = "echo ready; while read line; do echo \"got: $line\"; done";

    fn settings(program: &str, args: &[&str]) -> Arc<BridgeSettings> {
        Arc::new(BridgeSettings {
            shell_program: program.to_string(),
            shell_args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: std::env::temp_dir(),
            size: TerminalSize::default(),
            startup_delay: Duration::from_millis(300),
            write_timeout: Duration::from_secs(5),
            policy: CommandPolicy::new(DEFAULT_BLOCKED_COMMANDS.iter().copied()),
        })
    }

    fn echo_shell() -> Arc<BridgeSettings> {
        settings("/bin/sh", &["-c", READY_AND_ECHO])
    }

    async fn connect_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        connect_pair_buffered(64 * 1024).await
    }

    async fn connect_pair_buffered(
        buffer: usize,
    ) -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(buffer);
        let server = tokio::spawn(async move { accept_async(server_io).await.unwrap() });
        let (client, _) = client_async("ws://localhost/api/shell", client_io)
            .await
            .unwrap();
        (client, server.await.unwrap())
    }

    /// Start a bridge on the server half; returns the client half, the
    /// bridge task and the shutdown sender keeping the session alive
    async fn start(
        settings: Arc<BridgeSettings>,
        request: ShellRequest,
    ) -> (
        WebSocketStream<DuplexStream>,
        JoinHandle<BridgeResult<SessionSummary>>,
        broadcast::Sender<()>,
    ) {
        start_on(connect_pair().await, settings, request)
    }

    fn start_on(
        (client, server): (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>),
        settings: Arc<BridgeSettings>,
        request: ShellRequest,
    ) -> (
        WebSocketStream<DuplexStream>,
        JoinHandle<BridgeResult<SessionSummary>>,
        broadcast::Sender<()>,
    ) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            SessionBridge::new(settings)
                .run(server, request, shutdown_rx)
                .await
        });
        (client, task, shutdown_tx)
    }

    async fn send(client: &mut WebSocketStream<DuplexStream>, text: &str) {
        client
            .send(Message::Text(codec::encode(text.as_bytes())))
            .await
            .unwrap();
    }

    /// Collect decoded output until `needle` appears or the stream ends
    async fn read_until(client: &mut WebSocketStream<DuplexStream>, needle: &str) -> String {
        let mut output = String::new();
        let _ = timeout(Duration::from_secs(5), async {
            while let Some(Ok(message)) = client.next().await {
                if let Message::Text(text) = message {
                    let bytes = codec::decode(text.as_bytes()).unwrap();
                    output.push_str(&String::from_utf8_lossy(&bytes));
                    if output.contains(needle) {
                        break;
                    }
                }
            }
        })
        .await;
        output
    }

    async fn finish(
        task: JoinHandle<BridgeResult<SessionSummary>>,
    ) -> BridgeResult<SessionSummary> {
        timeout(Duration::from_secs(10), task)
            .await
            .expect("bridge did not finish")
            .unwrap()
    }

    #[test]
    fn test_shell_request_builders() {
        let mut vars = HashMap::new();
        vars.insert("A".to_string(), "1".to_string());
        let request = ShellRequest::default()
            .with_command("echo ${A}")
            .with_variables(vars.clone())
            .with_session("ops");
        assert_eq!(request.command.as_deref(), Some("echo ${A}"));
        assert_eq!(request.variables, vars);
        assert_eq!(request.session_name.as_deref(), Some("ops"));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = BridgeSettings::from_config(&ServiceConfig::default());
        assert_eq!(settings.shell_program, "/bin/bash");
        assert_eq!(settings.size, TerminalSize::new(80, 24));
        assert_eq!(settings.write_timeout, Duration::from_secs(10));
        assert_eq!(settings.startup_delay, Duration::from_millis(300));
        assert!(settings.policy.check("mkfs").is_err());
    }

    #[test]
    fn test_resolve_command_substitutes() {
        let bridge = SessionBridge::new(echo_shell());
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "world".to_string());

        let request = ShellRequest::default()
            .with_command("echo ${NAME}")
            .with_variables(vars);
        assert_eq!(
            bridge.resolve_command(&request).unwrap().as_deref(),
            Some("echo world")
        );
        assert_eq!(bridge.resolve_command(&ShellRequest::default()).unwrap(), None);
        assert_eq!(
            bridge
                .resolve_command(&ShellRequest::default().with_command(""))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_resolve_command_blocks_before_and_after_substitution() {
        let bridge = SessionBridge::new(echo_shell());
        let request = ShellRequest::default().with_command("sudo rm -rf / --no-preserve-root");
        assert!(matches!(
            bridge.resolve_command(&request),
            Err(BridgeError::PolicyViolation(_))
        ));

        let mut vars = HashMap::new();
        vars.insert("CMD".to_string(), "mkfs.ext4 /dev/sda1".to_string());
        let request = ShellRequest::default()
            .with_command("${CMD}")
            .with_variables(vars);
        assert!(matches!(
            bridge.resolve_command(&request),
            Err(BridgeError::PolicyViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_ready_then_echo() {
        let (mut client, task, _shutdown) = start(echo_shell(), ShellRequest::default()).await;

        let output = read_until(&mut client, "ready").await;
        assert!(output.contains("ready"));

        send(&mut client, "hello\n").await;
        let output = read_until(&mut client, "got: hello").await;
        assert!(output.contains("got: hello"));

        client.close(None).await.unwrap();
        let summary = finish(task).await.unwrap();
        assert_eq!(summary.end, SessionEnd::ClientClosed);
    }

    #[tokio::test]
    async fn test_terminal_echo_is_forwarded() {
        let (mut client, task, _shutdown) =
            start(settings("/bin/cat", &[]), ShellRequest::default()).await;

        send(&mut client, "ping-123\n").await;
        let output = read_until(&mut client, "ping-123").await;
        assert!(output.contains("ping-123"));

        client.close(None).await.unwrap();
        finish(task).await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_command_is_substituted() {
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "world".to_string());
        let request = ShellRequest::default()
            .with_command("echo ${NAME}")
            .with_variables(vars);

        let (mut client, task, _shutdown) = start(echo_shell(), request).await;
        let output = read_until(&mut client, "got: echo world").await;
        assert!(output.contains("ready"));
        assert!(output.contains("got: echo world"));

        client.close(None).await.unwrap();
        finish(task).await.unwrap();
    }

    #[tokio::test]
    async fn test_variables_are_exported_to_shell() {
        let mut vars = HashMap::new();
        vars.insert("FLOW_TARGET".to_string(), "staging".to_string());

        let (mut client, task, _shutdown) = start(
            settings("/bin/sh", &["-c", "echo \"target=$FLOW_TARGET term=$TERM\""]),
            ShellRequest::default().with_variables(vars),
        )
        .await;

        let output = read_until(&mut client, "term=xterm-256color").await;
        assert!(output.contains("target=staging term=xterm-256color"));
        finish(task).await.unwrap();
    }

    #[tokio::test]
    async fn test_shell_gets_pinned_environment() {
        let (mut client, task, _shutdown) = start(
            settings("/bin/sh", &["-c", "echo \"path=$PATH home=${HOME:+set}\""]),
            ShellRequest::default(),
        )
        .await;

        let expected = format!("path={} home=set", command::COMMAND_PATH);
        let output = read_until(&mut client, &expected).await;
        assert!(output.contains(&expected));
        finish(task).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_close_while_shell_ignores_input() {
        let (mut client, task, _shutdown) = start(
            settings("/bin/sh", &["-c", "stty -echo; echo up; sleep 3600"]),
            ShellRequest::default(),
        )
        .await;
        read_until(&mut client, "up").await;

        // Several times what the terminal buffers while nobody reads stdin
        let line = format!("{}\n", "y".repeat(79));
        let flood = line.repeat(4096);
        client
            .send(Message::Text(codec::encode(flood.as_bytes())))
            .await
            .unwrap();
        let _ = timeout(Duration::from_secs(5), client.close(None)).await;
        drop(client);

        let summary = finish(task).await.unwrap();
        assert!(matches!(
            summary.end,
            SessionEnd::ClientClosed | SessionEnd::Transport(_)
        ));
        assert!(summary.exit.is_some());
    }

    #[tokio::test]
    async fn test_stalled_client_hits_write_deadline() {
        let mut slow = (*settings("/bin/sh", &["-c", "while :; do echo flood; done"])).clone();
        slow.write_timeout = Duration::from_millis(200);

        // The client never reads, so the small pipe fills up
        let (_client, task, _shutdown) = start_on(
            connect_pair_buffered(1024).await,
            Arc::new(slow),
            ShellRequest::default(),
        );

        let summary = finish(task).await.unwrap();
        assert!(matches!(summary.end, SessionEnd::Transport(_)));
        assert!(summary.exit.is_some());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (mut client, task, _shutdown) = start(echo_shell(), ShellRequest::default()).await;
        read_until(&mut client, "ready").await;

        client
            .send(Message::Text("%%% not base64 %%%".to_string()))
            .await
            .unwrap();
        send(&mut client, "after\n").await;

        let output = read_until(&mut client, "got: after").await;
        assert!(output.contains("got: after"));

        client.close(None).await.unwrap();
        let summary = finish(task).await.unwrap();
        assert_eq!(summary.end, SessionEnd::ClientClosed);
    }

    #[tokio::test]
    async fn test_binary_frames_are_decoded() {
        let (mut client, task, _shutdown) = start(echo_shell(), ShellRequest::default()).await;
        read_until(&mut client, "ready").await;

        client
            .send(Message::Binary(codec::encode(b"bin\n").into_bytes()))
            .await
            .unwrap();
        let output = read_until(&mut client, "got: bin").await;
        assert!(output.contains("got: bin"));

        client.close(None).await.unwrap();
        finish(task).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_close_tears_down_shell() {
        let (mut client, task, _shutdown) =
            start(settings("/bin/sh", &["-c", "echo up; sleep 60"]), ShellRequest::default())
                .await;
        read_until(&mut client, "up").await;

        client.close(None).await.unwrap();
        let summary = finish(task).await.unwrap();

        assert_eq!(summary.end, SessionEnd::ClientClosed);
        let exit = summary.exit.expect("shell was not reaped");
        assert_eq!(exit.reason, ExitReason::Killed);
    }

    #[tokio::test]
    async fn test_client_drop_tears_down_shell() {
        let (client, task, _shutdown) =
            start(settings("/bin/sh", &["-c", "sleep 60"]), ShellRequest::default()).await;
        drop(client);

        let summary = finish(task).await.unwrap();
        assert!(matches!(
            summary.end,
            SessionEnd::ClientClosed | SessionEnd::Transport(_)
        ));
        assert!(summary.exit.is_some());
    }

    #[tokio::test]
    async fn test_process_exit_closes_connection() {
        let (mut client, task, _shutdown) =
            start(settings("/bin/sh", &["-c", "echo bye"]), ShellRequest::default()).await;

        let output = read_until(&mut client, "bye").await;
        assert!(output.contains("bye"));

        let summary = finish(task).await.unwrap();
        assert_eq!(summary.end, SessionEnd::ProcessEnded);
        assert_eq!(summary.exit.unwrap().reason, ExitReason::Normal);

        // The server closed its side; the client sees the stream end
        let rest = timeout(Duration::from_secs(5), async {
            while let Some(Ok(message)) = client.next().await {
                if message.is_close() {
                    return true;
                }
            }
            true
        })
        .await;
        assert_eq!(rest, Ok(true));
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let (mut client, task, shutdown) =
            start(settings("/bin/sh", &["-c", "echo up; sleep 60"]), ShellRequest::default())
                .await;
        read_until(&mut client, "up").await;

        shutdown.send(()).unwrap();
        let summary = finish(task).await.unwrap();
        assert_eq!(summary.end, SessionEnd::Shutdown);
        assert!(summary.exit.is_some());
    }

    #[tokio::test]
    async fn test_blocked_command_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let script = format!("touch {}; cat", marker.display());

        let (mut client, task, _shutdown) = start(
            settings("/bin/sh", &["-c", &script]),
            ShellRequest::default().with_command("sudo rm -rf / --no-preserve-root"),
        )
        .await;

        let result = finish(task).await;
        assert!(matches!(result, Err(BridgeError::PolicyViolation(_))));
        assert!(!marker.exists());

        // No data frames, just the close
        let next = timeout(Duration::from_secs(5), client.next()).await.unwrap();
        assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let (_client, task, _shutdown) =
            start(settings("/nonexistent/shell", &[]), ShellRequest::default()).await;
        let result = finish(task).await;
        assert!(matches!(result, Err(BridgeError::Spawn(PtyError::SpawnFailed(_)))));
    }

    #[tokio::test]
    async fn test_invalid_session_name_is_spawn_error() {
        let (_client, task, _shutdown) = start(
            echo_shell(),
            ShellRequest::default().with_session("bad:name"),
        )
        .await;
        let result = finish(task).await;
        assert!(matches!(
            result,
            Err(BridgeError::Spawn(PtyError::InvalidSessionName(_)))
        ));
    }
}
