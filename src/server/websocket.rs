//! WebSocket server implementation
//!
//! Accepts TCP connections, runs each upgrade request through the
//! [`UpgradeGate`] and hands accepted connections to a [`SessionBridge`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use super::handshake::{Rejection, UpgradeGate};
use crate::bridge::{BridgeSettings, SessionBridge, ShellRequest};
use crate::config::{ServiceConfig, WebSocketSection};

/// How long shutdown waits for open sessions to finish teardown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// WebSocket server for interactive shell connections
pub struct WebSocketServer {
    config: Arc<ServiceConfig>,
    gate: Arc<UpgradeGate>,
    bridge: Arc<BridgeSettings>,
    upgrade: WebSocketConfig,
    shutdown_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
    active: Arc<AtomicUsize>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            gate: Arc::new(UpgradeGate::from_config(&config)),
            bridge: Arc::new(BridgeSettings::from_config(&config)),
            upgrade: upgrade_config(&config.websocket),
            config: Arc::new(config),
            shutdown_tx,
            stopping: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Number of connections currently bridged to a shell
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind the configured address
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        Ok(listener)
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Returns once shutdown was requested and open sessions have drained,
    /// or the drain timeout passed.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "WebSocket server listening on ws://{}{}",
            local_addr, self.config.server.path
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !self.stopping.load(Ordering::SeqCst) {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let connection = Connection {
                                gate: Arc::clone(&self.gate),
                                bridge: Arc::clone(&self.bridge),
                                upgrade: self.upgrade.clone(),
                                shutdown_rx: self.shutdown_tx.subscribe(),
                                active: Arc::clone(&self.active),
                            };

                            tokio::spawn(async move {
                                if let Err(e) = connection.handle(stream, peer_addr).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        drop(listener);
        self.drain().await;
        Ok(())
    }

    /// Wait for open sessions to finish teardown
    async fn drain(&self) {
        let remaining = self.active_sessions();
        if remaining == 0 {
            return;
        }
        info!("Waiting for {} active sessions to close...", remaining);

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.active_sessions() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "{} sessions still open after {:?}",
                    self.active_sessions(),
                    DRAIN_TIMEOUT
                );
                return;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
        info!("All sessions closed");
    }
}

/// Upgrader settings for one server instance
fn upgrade_config(section: &WebSocketSection) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.write_buffer_size = section.write_buffer_size;
    config.max_message_size = Some(section.max_message_size);
    config
}

/// Counts a bridged connection for as long as it lives
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a spawned connection task needs
struct Connection {
    gate: Arc<UpgradeGate>,
    bridge: Arc<BridgeSettings>,
    upgrade: WebSocketConfig,
    shutdown_rx: broadcast::Receiver<()>,
    active: Arc<AtomicUsize>,
}

impl Connection {
    /// Handle a single connection
    async fn handle(self, stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
        debug!("New connection from {}", peer_addr);

        let mut accepted: Option<ShellRequest> = None;
        let gate = &self.gate;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match gate.inspect(request) {
                Ok(shell_request) => {
                    accepted = Some(shell_request);
                    Ok(response)
                }
                Err(rejection) => {
                    match &rejection {
                        Rejection::CommandBlocked { pattern } => warn!(
                            "Rejected upgrade from {}: command matches blocked pattern '{}'",
                            peer_addr, pattern
                        ),
                        _ => warn!("Rejected upgrade from {}: {}", peer_addr, rejection),
                    }
                    Err(rejection.into_response())
                }
            }
        };

        // Upgrade to WebSocket
        let upgraded = accept_hdr_async_with_config(stream, callback, Some(self.upgrade)).await;
        let (ws_stream, shell_request) = match (upgraded, accepted) {
            (Ok(ws_stream), Some(shell_request)) => (ws_stream, shell_request),
            // Refused by the gate, already logged
            (_, None) => return Ok(()),
            (Err(e), Some(_)) => return Err(e.into()),
        };

        let _active = ActiveGuard::new(Arc::clone(&self.active));
        info!(
            "Shell connection from {} (command: {}, session: {})",
            peer_addr,
            shell_request.command.is_some(),
            shell_request.session_name.as_deref().unwrap_or("-")
        );

        match SessionBridge::new(self.bridge)
            .run(ws_stream, shell_request, self.shutdown_rx)
            .await
        {
            Ok(summary) => {
                match summary.exit {
                    Some(exit) => info!(
                        "Connection from {} closed (session {}: {:?}, shell {:?} code {:?})",
                        peer_addr, summary.session_id, summary.end, exit.reason, exit.exit_code
                    ),
                    None => info!(
                        "Connection from {} closed (session {}: {:?}, shell not reaped)",
                        peer_addr, summary.session_id, summary.end
                    ),
                }
            }
            Err(e) => {
                warn!("Connection from {} closed without a shell: {}", peer_addr, e);
            }
        }

        Ok(())
    }
}
