//! Connection — one bidirectional websocket channel.
//!
//! DESIGN
//! ======
//! A [`Connection`] is a cheap clonable handle (`Arc` inside) shared by the
//! transport pump task and whatever higher layer keeps it. It knows nothing
//! about RPC: it moves opaque binary payloads and reports lifecycle events.
//!
//! Each connection owns one pump task running a `select!` loop:
//! - Incoming websocket frames → [`ConnectionEvent::Data`]
//! - Queued outbound payloads → websocket binary frames
//! - Local close signal → close frame (graceful) or drop (abrupt)
//!
//! Events flow through a single bounded channel ([`ConnectionEvents`]) with
//! one consumer, so delivery for a connection is ordered and never reentrant.
//! A consumer that stops draining stalls inbound reads but never a local
//! close: every event send races the close signal.
//!
//! LIFECYCLE
//! =========
//! 1. Socket established (accept or connect) → state `Open`, `Connected` queued
//! 2. Binary frames → `Data`; text frames are ignored
//! 3. Oversized frame or socket error → `Error`, then teardown
//! 4. Either side closes → state `Closed` (terminal), `Disconnected` queued

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;

const OUTBOUND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

/// Websocket close code for a normal closure.
const CLOSE_NORMAL: u16 = 1000;
/// Websocket close code for an oversized message.
const CLOSE_TOO_BIG: u16 = 1009;
/// Bound on writing a close frame during teardown.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// TYPES
// =============================================================================

/// Which side initiated the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by a [`crate::listener::Listener`].
    Inbound,
    /// Opened by [`crate::connector::connect`].
    Outbound,
}

/// Lifecycle position. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    /// True for an orderly close handshake with a normal close code.
    pub graceful: bool,
    pub code: Option<u16>,
    pub reason: String,
}

/// Notification emitted by a connection, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Data(Vec<u8>),
    Error(String),
    Disconnected(DisconnectReason),
}

// =============================================================================
// HANDLE
// =============================================================================

struct Inner {
    id: Uuid,
    direction: Direction,
    remote: Option<String>,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::Sender<Vec<u8>>,
    close: CancellationToken,
    close_graceful: AtomicBool,
}

/// Shared handle to one websocket channel.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Remote URL for outbound connections.
    #[must_use]
    pub fn remote(&self) -> Option<&str> {
        self.inner.remote.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queue `bytes` as one binary websocket message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SendFailed`] when the connection is not open
    /// or its pump has already exited.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(TransportError::SendFailed { connection_id: self.inner.id, state });
        }
        self.inner
            .outbound
            .send(bytes)
            .await
            .map_err(|_| TransportError::SendFailed { connection_id: self.inner.id, state: self.state() })
    }

    /// Close the channel and wait until it reaches `Closed`. Idempotent.
    ///
    /// A graceful close sends a websocket close frame; otherwise the socket
    /// is dropped.
    pub async fn close(&self, graceful: bool) {
        let transitioned = self.inner.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Open => {
                *state = ConnectionState::Closing;
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        });
        if transitioned {
            self.inner.close_graceful.store(graceful, Ordering::SeqCst);
            self.inner.close.cancel();
        }
        self.closed().await;
    }

    /// Resolves once the connection is `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `inner`, which we hold, so this only returns on `Closed`.
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }
}

/// Ordered event stream of one connection. Exactly one consumer.
#[derive(Debug)]
pub struct ConnectionEvents {
    connection_id: Uuid,
    rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionEvents {
    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Next event, or `None` after `Disconnected` has been delivered.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

// =============================================================================
// SOCKET ABSTRACTION
// =============================================================================

/// Classified incoming websocket frame.
pub(crate) enum Incoming {
    Binary(Vec<u8>),
    Text,
    Close(Option<(u16, String)>),
    Control,
}

/// Message type of a websocket implementation (axum server side, tungstenite
/// client side).
pub(crate) trait WsMessage: Sized + Send + 'static {
    fn binary(data: Vec<u8>) -> Self;
    fn close(code: u16, reason: &str) -> Self;
    fn classify(self) -> Incoming;
}

impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data.into())
    }

    fn close(code: u16, reason: &str) -> Self {
        Self::Close(Some(axum::extract::ws::CloseFrame { code, reason: reason.to_owned().into() }))
    }

    fn classify(self) -> Incoming {
        match self {
            Self::Binary(bytes) => Incoming::Binary(bytes.to_vec()),
            Self::Text(_) => Incoming::Text,
            Self::Close(frame) => Incoming::Close(frame.map(|f| (f.code, f.reason.as_str().to_owned()))),
            Self::Ping(_) | Self::Pong(_) => Incoming::Control,
        }
    }
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data.into())
    }

    fn close(code: u16, reason: &str) -> Self {
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        Self::Close(Some(CloseFrame { code: code.into(), reason: reason.to_owned().into() }))
    }

    fn classify(self) -> Incoming {
        match self {
            Self::Binary(bytes) => Incoming::Binary(bytes.to_vec()),
            Self::Text(_) => Incoming::Text,
            Self::Close(frame) => Incoming::Close(frame.map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))),
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => Incoming::Control,
        }
    }
}

// =============================================================================
// PUMP
// =============================================================================

/// Wrap an established websocket in a [`Connection`] and start its pump.
pub(crate) fn spawn<S, M, E>(
    socket: S,
    direction: Direction,
    remote: Option<String>,
    max_message_size: Option<usize>,
) -> (Connection, ConnectionEvents)
where
    S: Stream<Item = Result<M, E>> + Sink<M> + Unpin + Send + 'static,
    <S as Sink<M>>::Error: fmt::Display + Send,
    M: WsMessage,
    E: fmt::Display + Send + 'static,
{
    let id = Uuid::new_v4();
    let (state, _) = watch::channel(ConnectionState::Connecting);
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

    let inner = Arc::new(Inner {
        id,
        direction,
        remote,
        state,
        outbound,
        close: CancellationToken::new(),
        close_graceful: AtomicBool::new(true),
    });
    inner.state.send_replace(ConnectionState::Open);
    info!(connection_id = %id, ?direction, remote = ?inner.remote, "connection: open");

    tokio::spawn(pump(socket, Arc::clone(&inner), outbound_rx, events_tx, max_message_size));

    (Connection { inner }, ConnectionEvents { connection_id: id, rx: events_rx })
}

async fn pump<S, M, E>(
    mut socket: S,
    inner: Arc<Inner>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<ConnectionEvent>,
    max_message_size: Option<usize>,
) where
    S: Stream<Item = Result<M, E>> + Sink<M> + Unpin + Send + 'static,
    <S as Sink<M>>::Error: fmt::Display + Send,
    M: WsMessage,
    E: fmt::Display + Send,
{
    let id = inner.id;
    // A consumer that dropped its receiver just stops getting events.
    let _ = events.send(ConnectionEvent::Connected).await;

    let reason = loop {
        tokio::select! {
            incoming = socket.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(connection_id = %id, error = %e, "connection: socket error");
                        emit(&events, &inner.close, ConnectionEvent::Error(e.to_string())).await;
                        break DisconnectReason { graceful: false, code: None, reason: e.to_string() };
                    }
                    None => break DisconnectReason { graceful: false, code: None, reason: "stream ended".to_owned() },
                };
                match msg.classify() {
                    Incoming::Binary(bytes) => {
                        if let Some(limit) = max_message_size.filter(|limit| bytes.len() > *limit) {
                            let error = format!("message of {} bytes exceeds limit of {limit}", bytes.len());
                            warn!(connection_id = %id, size = bytes.len(), limit, "connection: oversized message");
                            emit(&events, &inner.close, ConnectionEvent::Error(error.clone())).await;
                            let frame = M::close(CLOSE_TOO_BIG, "message too big");
                            let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, socket.send(frame)).await;
                            break DisconnectReason { graceful: false, code: Some(CLOSE_TOO_BIG), reason: error };
                        }
                        if !emit(&events, &inner.close, ConnectionEvent::Data(bytes)).await {
                            break close_locally::<S, M>(&mut socket, &inner).await;
                        }
                    }
                    Incoming::Text => debug!(connection_id = %id, "connection: ignoring text frame"),
                    Incoming::Close(frame) => {
                        let (code, reason) = frame.unwrap_or((CLOSE_NORMAL, String::new()));
                        break DisconnectReason { graceful: code == CLOSE_NORMAL, code: Some(code), reason };
                    }
                    Incoming::Control => {}
                }
            }
            Some(bytes) = outbound_rx.recv() => {
                if let Err(e) = socket.send(M::binary(bytes)).await {
                    warn!(connection_id = %id, error = %e, "connection: send failed");
                    emit(&events, &inner.close, ConnectionEvent::Error(e.to_string())).await;
                    break DisconnectReason { graceful: false, code: None, reason: e.to_string() };
                }
            }
            () = inner.close.cancelled() => break close_locally::<S, M>(&mut socket, &inner).await,
        }
    };

    inner.state.send_replace(ConnectionState::Closed);
    drop(socket);
    info!(connection_id = %id, graceful = reason.graceful, reason = %reason.reason, "connection: closed");
    let _ = events.send(ConnectionEvent::Disconnected(reason)).await;
}

/// Queue `event` for the consumer unless a local close is requested first.
/// Returns `false` when the close won; the event is then dropped.
async fn emit(events: &mpsc::Sender<ConnectionEvent>, close: &CancellationToken, event: ConnectionEvent) -> bool {
    tokio::select! {
        biased;
        () = close.cancelled() => false,
        permit = events.reserve() => {
            if let Ok(permit) = permit {
                permit.send(event);
            }
            true
        }
    }
}

async fn close_locally<S, M>(socket: &mut S, inner: &Inner) -> DisconnectReason
where
    S: Sink<M> + Unpin,
    M: WsMessage,
{
    let graceful = inner.close_graceful.load(Ordering::SeqCst);
    if graceful {
        // A peer that stopped reading must not hold the teardown hostage.
        let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, socket.send(M::close(CLOSE_NORMAL, "normal closure"))).await;
    }
    DisconnectReason { graceful, code: Some(CLOSE_NORMAL), reason: "closed locally".to_owned() }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Two connected in-memory connections: (outbound side, inbound side).
    pub(crate) async fn connected_pair() -> ((Connection, ConnectionEvents), (Connection, ConnectionEvents)) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (client, server) = tokio::join!(
            WebSocketStream::from_raw_socket(a, Role::Client, None),
            WebSocketStream::from_raw_socket(b, Role::Server, None),
        );
        (spawn(client, Direction::Outbound, None, None), spawn(server, Direction::Inbound, None, None))
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
