//! Endpoint — one local RPC identity.
//!
//! DESIGN
//! ======
//! An [`Endpoint`] owns an isolated [`Correlator`] and [`Dispatcher`]. Every
//! attached connection gets a delivery task draining its
//! [`ConnectionEvents`] in order:
//! - `Data` → decode → reply routing, or a spawned dispatch for requests
//! - `Disconnected` → reject that connection's pending calls, exit
//! - `Error` → log
//!
//! Dispatch runs on its own task so a slow handler never holds up replies or
//! other requests on the same connection.
//!
//! LIFECYCLE
//! =========
//! `stop()` rejects every pending call, refuses new ones and ends all
//! delivery tasks. Connections themselves are left open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use frames::decode_message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionEvents};
use crate::correlator::{Correlator, Routed};
use crate::dispatcher::{Dispatcher, Handler, Metadata, MethodOptions};
use crate::error::{DuplicateRegistration, RpcError};

struct Inner {
    config: RpcConfig,
    correlator: Correlator,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

/// Cheap clonable handle to one local RPC identity.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(RpcConfig::default())
    }
}

impl Endpoint {
    #[must_use]
    pub fn new(config: RpcConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                correlator: Correlator::new(),
                dispatcher: Dispatcher::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> RpcConfig {
        self.inner.config
    }

    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    /// # Errors
    ///
    /// [`DuplicateRegistration`] when `method` already has a handler.
    pub fn register(&self, method: &str, handler: impl Handler + 'static) -> Result<(), DuplicateRegistration> {
        self.inner.dispatcher.register(method, handler)
    }

    /// # Errors
    ///
    /// [`DuplicateRegistration`] when `method` already has a handler.
    pub fn register_with_options(
        &self,
        method: &str,
        handler: impl Handler + 'static,
        options: MethodOptions,
    ) -> Result<(), DuplicateRegistration> {
        self.inner.dispatcher.register_with_options(method, handler, options)
    }

    /// # Errors
    ///
    /// [`DuplicateRegistration`] when `method` already has a handler.
    pub fn register_notification(
        &self,
        method: &str,
        handler: impl Handler + 'static,
    ) -> Result<(), DuplicateRegistration> {
        self.inner.dispatcher.register_notification(method, handler)
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Start delivering `events` into this endpoint with empty metadata.
    pub fn attach(&self, connection: Connection, events: ConnectionEvents) {
        self.attach_with_metadata(connection, events, Arc::new(HashMap::new()));
    }

    /// Start delivering `events` into this endpoint. `metadata` is handed to
    /// every handler serving a request from this connection.
    pub fn attach_with_metadata(&self, connection: Connection, events: ConnectionEvents, metadata: Metadata) {
        let endpoint = self.clone();
        tokio::spawn(async move { endpoint.deliver(connection, events, metadata).await });
    }

    async fn deliver(self, connection: Connection, mut events: ConnectionEvents, metadata: Metadata) {
        let connection_id = connection.id();
        debug!(%connection_id, "endpoint: delivery started");
        loop {
            let event = tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(ConnectionEvent::Connected) => debug!(%connection_id, "endpoint: connected"),
                Some(ConnectionEvent::Data(bytes)) => self.on_data(&bytes, &connection, &metadata),
                Some(ConnectionEvent::Error(error)) => warn!(%connection_id, %error, "endpoint: connection error"),
                Some(ConnectionEvent::Disconnected(reason)) => {
                    info!(%connection_id, graceful = reason.graceful, reason = %reason.reason, "endpoint: disconnected");
                    self.inner.correlator.fail_connection(connection_id);
                    break;
                }
                None => {
                    self.inner.correlator.fail_connection(connection_id);
                    break;
                }
            }
        }
        debug!(%connection_id, "endpoint: delivery stopped");
    }

    fn on_data(&self, bytes: &[u8], connection: &Connection, metadata: &Metadata) {
        let message = match decode_message(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = %connection.id(), size = bytes.len(), error = %RpcError::from(e), "endpoint: dropping undecodable message");
                return;
            }
        };
        match self.inner.correlator.route(message) {
            Routed::Settled | Routed::Late | Routed::Ignored => {}
            Routed::NotReply(message) => {
                let endpoint = self.clone();
                let connection = connection.clone();
                let metadata = Arc::clone(metadata);
                tokio::spawn(async move {
                    endpoint.inner.dispatcher.dispatch(message, &connection, metadata).await;
                });
            }
        }
    }

    // =========================================================================
    // CALLS
    // =========================================================================

    /// Call `method` with the configured default timeout and no cancellation.
    ///
    /// # Errors
    ///
    /// See [`Correlator::call`].
    pub async fn call(&self, method: &str, payload: Vec<u8>, connection: &Connection) -> Result<Vec<u8>, RpcError> {
        let token = CancellationToken::new();
        self.call_with_timeout(method, payload, connection, self.inner.config.default_timeout, &token).await
    }

    /// # Errors
    ///
    /// See [`Correlator::call`].
    pub async fn call_with_timeout(
        &self,
        method: &str,
        payload: Vec<u8>,
        connection: &Connection,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, RpcError> {
        self.inner.correlator.call(method, payload, connection, timeout, token).await
    }

    /// # Errors
    ///
    /// See [`Correlator::notify`].
    pub async fn notify(&self, method: &str, payload: Vec<u8>, connection: &Connection) -> Result<(), RpcError> {
        self.inner.correlator.notify(method, payload, connection).await
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Reject pending calls and stop all delivery. Idempotent.
    pub fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.correlator.stop();
        self.inner.shutdown.cancel();
        info!("endpoint: stopped");
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

#[cfg(test)]
#[path = "endpoint_test.rs"]
mod tests;
