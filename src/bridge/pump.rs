//! Byte pumps between a PTY session and a WebSocket
//!
//! Each pump owns one half of the connection and runs as its own task. Both
//! watch the same cancellation channel at every suspension point, so teardown
//! never depends on a blocked read or write happening to fail.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use super::codec;
use super::session::SessionEnd;
use crate::pty::{PtyError, PtyRead, PtySession};

/// PTY → connection
///
/// Returns the sink so the caller can close the connection, plus the reason
/// the pump stopped (`None` when cancelled). `ready` fires on the first chunk
/// of output.
pub(super) async fn forward_output<K>(
    session: Arc<PtySession>,
    mut sink: K,
    write_timeout: Duration,
    mut cancel: watch::Receiver<bool>,
    ready: oneshot::Sender<()>,
) -> (K, Option<SessionEnd>)
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    let session_id = session.id();
    let mut ready = Some(ready);

    loop {
        if *cancel.borrow() {
            return (sink, None);
        }

        let read = tokio::select! {
            _ = cancel.changed() => return (sink, None),
            read = session.read() => read,
        };

        let data = match read {
            Ok(PtyRead::Data(data)) => data,
            Ok(PtyRead::Idle) => continue,
            Ok(PtyRead::Eof) => {
                debug!("Session {}: shell process ended", session_id);
                return (sink, Some(SessionEnd::ProcessEnded));
            }
            Err(e) => {
                debug!("Session {}: PTY read failed: {}", session_id, e);
                return (sink, Some(SessionEnd::Pty(e.to_string())));
            }
        };

        if let Some(ready) = ready.take() {
            let _ = ready.send(());
        }

        let frame = Message::Text(codec::encode(&data));
        let sent = tokio::select! {
            _ = cancel.changed() => return (sink, None),
            sent = timeout(write_timeout, sink.send(frame)) => sent,
        };

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Session {}: WebSocket write failed: {}", session_id, e);
                return (sink, Some(SessionEnd::Transport(e.to_string())));
            }
            Err(_) => {
                warn!(
                    "Session {}: WebSocket write exceeded {:?}",
                    session_id, write_timeout
                );
                return (
                    sink,
                    Some(SessionEnd::Transport(format!(
                        "write deadline of {write_timeout:?} exceeded"
                    ))),
                );
            }
        }
    }
}

/// Connection → PTY
///
/// Malformed frames are logged and dropped; they never end the session.
/// Writes only wait for room in the session's input queue and race the
/// cancellation signal.
pub(super) async fn forward_input<St>(
    session: Arc<PtySession>,
    mut stream: St,
    mut cancel: watch::Receiver<bool>,
) -> Option<SessionEnd>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let session_id = session.id();

    loop {
        if *cancel.borrow() {
            return None;
        }

        let message = tokio::select! {
            _ = cancel.changed() => return None,
            message = stream.next() => message,
        };

        let payload = match message {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => {
                debug!("Session {}: client closed the connection", session_id);
                return Some(SessionEnd::ClientClosed);
            }
            // Pings are answered by the transport
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Session {}: WebSocket read failed: {}", session_id, e);
                return Some(SessionEnd::Transport(e.to_string()));
            }
        };

        let input = match codec::decode(&payload) {
            Ok(input) => input,
            Err(e) => {
                warn!(
                    "Session {}: dropping {} byte frame: {}",
                    session_id,
                    payload.len(),
                    e
                );
                continue;
            }
        };
        if input.is_empty() {
            continue;
        }

        let written = tokio::select! {
            _ = cancel.changed() => return None,
            written = session.write(&input) => written,
        };

        match written {
            Ok(()) => {}
            // The output side reports the exit once the remaining output is
            // forwarded
            Err(PtyError::ProcessExited) => {
                debug!(
                    "Session {}: dropping {} bytes typed after shell exit",
                    session_id,
                    input.len()
                );
            }
            Err(e) => {
                debug!("Session {}: PTY write failed: {}", session_id, e);
                return Some(SessionEnd::Pty(e.to_string()));
            }
        }
    }
}

/// Write the startup command once the shell has produced output, or once
/// `max_wait` has passed, whichever comes first
pub(super) async fn inject_startup(
    session: Arc<PtySession>,
    command: String,
    ready: oneshot::Receiver<()>,
    max_wait: Duration,
    settle: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let wait = async {
        let _ = timeout(max_wait, ready).await;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
    };

    tokio::select! {
        _ = cancel.changed() => return,
        _ = wait => {}
    }

    debug!("Session {}: sending startup command", session.id());
    let line = format!("{command}\n");
    let written = tokio::select! {
        _ = cancel.changed() => return,
        written = session.write(line.as_bytes()) => written,
    };
    if let Err(e) = written {
        warn!(
            "Session {}: failed to send startup command: {}",
            session.id(),
            e
        );
    }
}
