//! Listener — websocket server bound to the first free port of a range.
//!
//! DESIGN
//! ======
//! Ports are tried in order from `min` to `max`; each rejected port is logged
//! and the next one tried. Start only fails once the whole range is
//! exhausted. The bound socket is served by axum: every HTTP request on any
//! path is treated as a websocket upgrade, and each upgraded socket becomes a
//! [`Connection`] handed out through [`Listener::accept`].
//!
//! With TLS enabled a separate accept task owns the TCP listener and runs
//! every rustls handshake on its own task; axum only sees streams whose
//! handshake finished, so a silent client never delays the ones behind it.
//!
//! LIFECYCLE
//! =========
//! `stop()` releases the listening socket. Connections already accepted keep
//! running; closing them is the owner's job.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{PortRange, ServerConfig};
use crate::connection::{self, Connection, ConnectionEvents, Direction};
use crate::error::TransportError;

const ACCEPT_CAPACITY: usize = 64;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const STOP_GRACE: Duration = Duration::from_secs(2);

/// An accepted connection and its event stream.
pub type Accepted = (Connection, ConnectionEvents);

/// Running websocket server.
pub struct Listener {
    port: u16,
    tls: bool,
    accepted: mpsc::Receiver<Accepted>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    tls_accept: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct AcceptState {
    accepted: mpsc::Sender<Accepted>,
    max_message_size: usize,
}

impl Listener {
    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidConfig`] for an unusable config
    /// - [`TransportError::Tls`] when TLS material cannot be prepared
    /// - [`TransportError::ServerStartFailed`] when no port in the range binds
    pub async fn start(config: ServerConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let tls = if config.enable_tls {
            Some(crate::tls::server_config(config.tls_certificate_files.as_ref())?)
        } else {
            None
        };

        let range = config.port_range;
        let start_failed = |_: std::io::Error| TransportError::ServerStartFailed { min: range.min, max: range.max };
        let listener = bind_in_range(&config.bind_address, range).await?;
        let port = listener.local_addr().map_err(start_failed)?.port();

        let max_message_size = config.message_limit();
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_CAPACITY);
        let app = Router::new()
            .fallback(upgrade)
            .layer(TraceLayer::new_for_http())
            .with_state(AcceptState { accepted: accepted_tx, max_message_size });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let signal = async move {
            let _ = shutdown_rx.await;
        };

        let (task, tls_accept) = match tls.clone() {
            None => {
                let task = tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
                        warn!(port, error = %e, "listener: server exited with error");
                    }
                });
                (task, None)
            }
            Some(server_config) => {
                let (listener, tls_accept) =
                    TlsListener::spawn(listener, TlsAcceptor::from(server_config)).map_err(start_failed)?;
                let task = tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
                        warn!(port, error = %e, "listener: server exited with error");
                    }
                });
                (task, Some(tls_accept))
            }
        };

        info!(port, tls = tls.is_some(), max_message_size, "listener: started");
        Ok(Self {
            port,
            tls: tls.is_some(),
            accepted: accepted_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
            tls_accept,
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// URL a local client should dial.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://127.0.0.1:{}", self.port)
    }

    /// Next accepted connection, or `None` once stopped.
    pub async fn accept(&mut self) -> Option<Accepted> {
        self.accepted.recv().await
    }

    /// Release the listening socket. Accepted connections stay open.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                abort.abort();
            }
            info!(port = self.port, "listener: stopped");
        }
        // The TLS accept task owns the socket; wait for it to drop.
        if let Some(task) = self.tls_accept.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.tls_accept.take() {
            task.abort();
        }
    }
}

async fn bind_in_range(address: &str, range: PortRange) -> Result<TcpListener, TransportError> {
    for port in range.ports() {
        match TcpListener::bind((address, port)).await {
            Ok(listener) => {
                debug!(address, port, "listener: bound");
                return Ok(listener);
            }
            Err(e) => warn!(address, port, error = %e, "listener: port unavailable, trying next"),
        }
    }
    Err(TransportError::ServerStartFailed { min: range.min, max: range.max })
}

async fn upgrade(State(state): State<AcceptState>, ws: WebSocketUpgrade) -> Response {
    let limit = state.max_message_size;
    ws.max_message_size(limit).max_frame_size(limit).on_upgrade(move |socket| async move {
        let (connection, events) = connection::spawn(socket, Direction::Inbound, None, Some(limit));
        if state.accepted.send((connection.clone(), events)).await.is_err() {
            warn!(connection_id = %connection.id(), "listener: nobody accepting, dropping connection");
            connection.close(false).await;
        }
    })
}

// =============================================================================
// TLS
// =============================================================================

type TlsHandshaken = (tokio_rustls::server::TlsStream<TcpStream>, SocketAddr);

/// Hands axum streams whose TLS handshake already completed.
struct TlsListener {
    ready: mpsc::Receiver<TlsHandshaken>,
    local_addr: SocketAddr,
}

impl TlsListener {
    fn spawn(tcp: TcpListener, acceptor: TlsAcceptor) -> std::io::Result<(Self, JoinHandle<()>)> {
        let local_addr = tcp.local_addr()?;
        let (ready_tx, ready) = mpsc::channel(ACCEPT_CAPACITY);
        let task = tokio::spawn(accept_tls(tcp, acceptor, ready_tx));
        Ok((Self { ready, local_addr }, task))
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = tokio_rustls::server::TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(handshaken) => handshaken,
            // The accept task is gone, which only happens during stop.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

async fn accept_tls(tcp: TcpListener, acceptor: TlsAcceptor, ready: mpsc::Sender<TlsHandshaken>) {
    loop {
        let (stream, addr) = tokio::select! {
            () = ready.closed() => break,
            accepted = tcp.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "listener: accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = ready.send((tls, addr)).await;
                }
                Ok(Err(e)) => debug!(%addr, error = %e, "listener: tls handshake failed"),
                Err(_) => debug!(%addr, "listener: tls handshake timed out"),
            }
        });
    }
    debug!("listener: tls accept loop stopped");
}

#[cfg(test)]
#[path = "listener_test.rs"]
mod tests;
