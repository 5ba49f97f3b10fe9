//! Outbound connector — dials a remote websocket endpoint.
//!
//! Peers in the overlay usually run with generated certificates, so TLS
//! verification is skipped unless [`ConnectOptions::accept_self_signed`] is
//! turned off, in which case the bundled webpki roots are used.

use std::time::Duration;

use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::connection::{self, Connection, ConnectionEvents, Direction};
use crate::error::TransportError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Skip server certificate verification on `wss://` targets.
    pub accept_self_signed: bool,
    /// Largest accepted inbound message, in bytes.
    pub max_message_size: usize,
    /// Bound on TCP connect plus handshakes.
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { accept_self_signed: true, max_message_size: DEFAULT_MAX_MESSAGE_SIZE, timeout: DEFAULT_CONNECT_TIMEOUT }
    }
}

/// Open a connection to `address` (`host:port` or a full `ws://` / `wss://`
/// URL) with default options.
///
/// # Errors
///
/// [`TransportError::ConnectFailed`] when the target is unreachable or the
/// TLS or websocket handshake fails.
pub async fn connect(address: &str, use_tls: bool) -> Result<(Connection, ConnectionEvents), TransportError> {
    connect_with(&target_url(address, use_tls), &ConnectOptions::default()).await
}

/// Open a connection to `url`.
///
/// # Errors
///
/// [`TransportError::ConnectFailed`] when the target is unreachable, the
/// handshake fails or `options.timeout` elapses; [`TransportError::Tls`] when
/// the client TLS config cannot be built.
pub async fn connect_with(url: &str, options: &ConnectOptions) -> Result<(Connection, ConnectionEvents), TransportError> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(options.max_message_size);
    ws_config.max_frame_size = Some(options.max_message_size);

    let connector = if url.starts_with("wss://") && options.accept_self_signed {
        Some(Connector::Rustls(crate::tls::insecure_client_config()?))
    } else {
        crate::tls::install_default_provider();
        None
    };

    debug!(url, "connector: dialing");
    let dial = tokio_tungstenite::connect_async_tls_with_config(url, Some(ws_config), true, connector);
    let (stream, _) = match tokio::time::timeout(options.timeout, dial).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(url, error = %e, "connector: connect failed");
            return Err(TransportError::ConnectFailed { url: url.to_owned(), reason: e.to_string() });
        }
        Err(_) => {
            warn!(url, timeout_ms = options.timeout.as_millis(), "connector: connect timed out");
            return Err(TransportError::ConnectFailed {
                url: url.to_owned(),
                reason: format!("timed out after {}ms", options.timeout.as_millis()),
            });
        }
    };

    Ok(connection::spawn(stream, Direction::Outbound, Some(url.to_owned()), Some(options.max_message_size)))
}

/// Turn `host:port` into a websocket URL; full URLs pass through.
#[must_use]
pub fn target_url(address: &str, use_tls: bool) -> String {
    if address.contains("://") {
        return address.to_owned();
    }
    let scheme = if use_tls { "wss" } else { "ws" };
    format!("{scheme}://{address}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_url_adds_scheme() {
        assert_eq!(target_url("127.0.0.1:10000", false), "ws://127.0.0.1:10000");
        assert_eq!(target_url("127.0.0.1:10000", true), "wss://127.0.0.1:10000");
        assert_eq!(target_url("ws://peer:1", true), "ws://peer:1");
    }

    #[tokio::test]
    async fn unreachable_target_is_connect_failed() {
        // Bind then drop to get a port that is very likely closed.
        let port = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").expect("spare bind");
            spare.local_addr().expect("spare addr").port()
        };
        let err = connect(&format!("127.0.0.1:{port}"), false).await.expect_err("nothing listening");
        assert!(matches!(err, TransportError::ConnectFailed { url, .. } if url.ends_with(&port.to_string())));
    }
}
