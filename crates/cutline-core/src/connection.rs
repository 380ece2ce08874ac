//! Persistent channel management.
//!
//! One WebSocket per session, owned by a spawned task. The task keeps the
//! channel alive with heartbeats, reconnects after transient closures with
//! a fixed delay, and stops for good on either a user-initiated close or
//! the distinguished "session not found" close code.
//!
//! Outbound sends are fire-and-forget: messages submitted while the channel
//! is not connected are silently dropped. Callers must not assume delivery;
//! anything that matters is re-derivable from the next server snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::interval_at;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use cutline_types::wire::CLOSE_SESSION_NOT_FOUND;
use cutline_types::{ClientMessage, ServerEvent};

/// Connection lifecycle state, as reported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ClosingByUser,
}

/// Events delivered from the connection task to the runtime.
#[derive(Debug)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A parsed inbound frame. Malformed frames never get this far.
    Frame(ServerEvent),
    /// The server closed with the "session not found" code. Unrecoverable
    /// locally; no reconnect will be attempted.
    SessionLost,
}

/// Parameters for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

/// Cloneable handle for sending on and closing the channel.
#[derive(Clone)]
pub struct ConnectionHandle {
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    shutdown: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Fire-and-forget send. Dropped silently unless the channel is
    /// currently connected.
    pub fn send(&self, msg: ClientMessage) {
        if !self.connected.load(Ordering::SeqCst) {
            trace!("dropping outbound message while not connected");
            return;
        }
        let _ = self.out_tx.send(msg);
    }

    /// Marks the closure as user-initiated and shuts the task down.
    /// No reconnect is attempted after this.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// How a closure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    /// Schedule a reconnect after the fixed delay.
    Transient,
    /// Session is gone server-side; stop and tell the owner.
    SessionGone,
}

fn classify_close(frame: Option<&CloseFrame<'_>>) -> CloseKind {
    match frame {
        Some(cf) if u16::from(cf.code) == CLOSE_SESSION_NOT_FOUND => CloseKind::SessionGone,
        _ => CloseKind::Transient,
    }
}

/// Spawns the connection task and returns its handle plus the event stream.
pub fn connect(config: ConnectionConfig) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let connected = Arc::new(AtomicBool::new(false));

    let handle = ConnectionHandle {
        out_tx,
        shutdown: shutdown.clone(),
        connected: Arc::clone(&connected),
    };

    tokio::spawn(run(config, out_rx, event_tx, shutdown, connected));

    (handle, event_rx)
}

async fn run(
    config: ConnectionConfig,
    mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: CancellationToken,
    connected: Arc<AtomicBool>,
) {
    let emit = |ev: ConnectionEvent| {
        let _ = event_tx.send(ev);
    };

    loop {
        emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));

        let ws = tokio::select! {
            () = shutdown.cancelled() => {
                emit(ConnectionEvent::StateChanged(ConnectionState::ClosingByUser));
                return;
            }
            result = connect_async(config.url.as_str()) => match result {
                Ok((ws, _)) => ws,
                Err(err) => {
                    warn!(url = %config.url, error = %err, "connect failed");
                    emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
                    if wait_for_retry(&shutdown, config.reconnect_delay).await {
                        emit(ConnectionEvent::StateChanged(ConnectionState::ClosingByUser));
                        return;
                    }
                    continue;
                }
            },
        };

        let (mut ws_tx, mut ws_rx) = ws.split();
        connected.store(true, Ordering::SeqCst);
        emit(ConnectionEvent::StateChanged(ConnectionState::Connected));

        // First ping only after a full interval, not on connect.
        let start = tokio::time::Instant::now() + config.heartbeat_interval;
        let mut heartbeat = interval_at(start, config.heartbeat_interval);

        let mut close_kind = CloseKind::Transient;
        let mut user_close = false;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client switch session".into(),
                        })))
                        .await;
                    user_close = true;
                    break;
                }

                Some(msg) = out_rx.recv() => {
                    if ws_tx.send(Message::Text(msg.to_wire())).await.is_err() {
                        break;
                    }
                }

                _ = heartbeat.tick() => {
                    if ws_tx.send(Message::Text(ClientMessage::Ping {}.to_wire())).await.is_err() {
                        break;
                    }
                }

                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match ServerEvent::parse(&text) {
                            Some(ev) => emit(ConnectionEvent::Frame(ev)),
                            // Robustness over strictness: drop and move on.
                            None => debug!("dropping malformed inbound frame"),
                        }
                    }
                    Some(Ok(Message::Close(cf))) => {
                        close_kind = classify_close(cf.as_ref());
                        break;
                    }
                    Some(Ok(_)) => {} // binary/ping/pong: nothing to do
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket error");
                        break;
                    }
                    None => break,
                },
            }
        }

        connected.store(false, Ordering::SeqCst);

        if user_close {
            emit(ConnectionEvent::StateChanged(ConnectionState::ClosingByUser));
            return;
        }

        if close_kind == CloseKind::SessionGone {
            emit(ConnectionEvent::SessionLost);
            return;
        }

        emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
        if wait_for_retry(&shutdown, config.reconnect_delay).await {
            emit(ConnectionEvent::StateChanged(ConnectionState::ClosingByUser));
            return;
        }
    }
}

/// Sleeps the reconnect delay. Returns true if shutdown was requested.
async fn wait_for_retry(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_found_close_is_fatal() {
        let frame = CloseFrame {
            code: CloseCode::from(CLOSE_SESSION_NOT_FOUND),
            reason: "session not found".into(),
        };
        assert_eq!(classify_close(Some(&frame)), CloseKind::SessionGone);
    }

    #[test]
    fn other_closures_are_transient() {
        let normal = CloseFrame { code: CloseCode::Normal, reason: "".into() };
        assert_eq!(classify_close(Some(&normal)), CloseKind::Transient);

        let abnormal = CloseFrame { code: CloseCode::from(1013_u16), reason: "busy".into() };
        assert_eq!(classify_close(Some(&abnormal)), CloseKind::Transient);

        assert_eq!(classify_close(None), CloseKind::Transient);
    }
}
