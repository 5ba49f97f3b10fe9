//! Dispatcher — method registry and request handling.
//!
//! DESIGN
//! ======
//! Handlers are pure business logic: they receive the request body and a
//! [`CallContext`] and return a body or a [`HandlerError`]. They never touch
//! the wire. [`Dispatcher::handle`] turns one inbound message into at most
//! one reply message; [`Dispatcher::dispatch`] adds the send.
//!
//! ERROR HANDLING
//! ==============
//! Nothing a handler does reaches the serving process's control flow:
//! - unknown method      → `UNKNOWN_METHOD` naming the method
//! - returned error      → `SERVER_ERROR` with class name, code, message
//! - panic               → `SERVER_ERROR` with class name `panic`
//! - method timeout hit  → `SERVER_TIMEOUT`
//!
//! Notifications run the same way but never produce a reply. Requests and
//! notifications only reach handlers registered for their own kind: a
//! request naming a notification handler is an unknown method, and a
//! notification naming a request handler is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use frames::{ErrorDetails, ErrorType, RpcMessage, encode_message};
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::error::{DuplicateRegistration, HandlerError};

/// Per-connection metadata handed to every handler (e.g. the peer identity).
pub type Metadata = Arc<HashMap<String, String>>;

/// Metadata key conventionally holding the remote peer's identity.
pub const METADATA_PEER: &str = "peer";

// =============================================================================
// HANDLERS
// =============================================================================

/// Everything a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Connection the request arrived on. Holding it keeps the handle alive.
    pub connection: Connection,
    pub request_id: String,
    pub method: String,
    pub header: HashMap<String, String>,
    pub metadata: Metadata,
}

impl CallContext {
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.metadata.get(METADATA_PEER).map(String::as_str)
    }
}

/// A registered method implementation.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Serve one call.
    ///
    /// # Errors
    ///
    /// A [`HandlerError`] becomes a `SERVER_ERROR` reply.
    async fn handle(&self, body: Vec<u8>, ctx: CallContext) -> Result<Vec<u8>, HandlerError>;
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Vec<u8>, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, body: Vec<u8>, ctx: CallContext) -> Result<Vec<u8>, HandlerError> {
        (self)(body, ctx).await
    }
}

/// Registration options for one method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodOptions {
    /// Server-side bound on handler execution.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Request,
    Notification,
}

#[derive(Clone)]
struct HandlerEntry {
    handler: Arc<dyn Handler>,
    kind: HandlerKind,
    options: MethodOptions,
}

// =============================================================================
// DISPATCHER
// =============================================================================

enum Outcome {
    Returned(Result<Vec<u8>, HandlerError>),
    Panicked(String),
    TimedOut(Duration),
}

/// Method-name → handler registry for one endpoint.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, HandlerEntry>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler for `method`.
    ///
    /// # Errors
    ///
    /// [`DuplicateRegistration`] when `method` already has a handler.
    pub fn register(&self, method: &str, handler: impl Handler + 'static) -> Result<(), DuplicateRegistration> {
        self.insert(method, Arc::new(handler), HandlerKind::Request, MethodOptions::default())
    }

    /// Register a request handler with per-method options.
    ///
    /// # Errors
    ///
    /// [`DuplicateRegistration`] when `method` already has a handler.
    pub fn register_with_options(
        &self,
        method: &str,
        handler: impl Handler + 'static,
        options: MethodOptions,
    ) -> Result<(), DuplicateRegistration> {
        self.insert(method, Arc::new(handler), HandlerKind::Request, options)
    }

    /// Register a notification handler; its result is never sent back.
    ///
    /// # Errors
    ///
    /// [`DuplicateRegistration`] when `method` already has a handler.
    pub fn register_notification(
        &self,
        method: &str,
        handler: impl Handler + 'static,
    ) -> Result<(), DuplicateRegistration> {
        self.insert(method, Arc::new(handler), HandlerKind::Notification, MethodOptions::default())
    }

    fn insert(
        &self,
        method: &str,
        handler: Arc<dyn Handler>,
        kind: HandlerKind,
        options: MethodOptions,
    ) -> Result<(), DuplicateRegistration> {
        let mut handlers = self.handlers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if handlers.contains_key(method) {
            return Err(DuplicateRegistration(method.to_owned()));
        }
        handlers.insert(method.to_owned(), HandlerEntry { handler, kind, options });
        debug!(method, ?kind, "rpc: registered handler");
        Ok(())
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, method: &str) -> Option<HandlerEntry> {
        let handlers = self.handlers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.get(method).cloned()
    }

    /// Serve `message` and send the reply, if any, on `connection`.
    pub async fn dispatch(&self, message: RpcMessage, connection: &Connection, metadata: Metadata) {
        let request_id = message.request_id.clone();
        let Some(reply) = self.handle(message, connection, metadata).await else {
            return;
        };
        if reply.error_type.is_some() {
            warn!(connection_id = %connection.id(), %request_id, error_type = ?reply.error_type, error = ?reply.error.message, "rpc: reply error");
        }
        if let Err(e) = connection.send(encode_message(&reply)).await {
            warn!(connection_id = %connection.id(), %request_id, error = %e, "rpc: reply send failed");
        }
    }

    /// Serve `message`, returning the reply to send (none for notifications).
    pub async fn handle(&self, mut message: RpcMessage, connection: &Connection, metadata: Metadata) -> Option<RpcMessage> {
        let notification = message.is_notification();

        let Some(method) = message.method().map(str::to_owned) else {
            if notification {
                warn!(request_id = %message.request_id, "rpc: notification without method dropped");
                return None;
            }
            let details = ErrorDetails { message: Some("request carries no method header".to_owned()), ..ErrorDetails::default() };
            return Some(message.error_reply(ErrorType::ClientError, details));
        };

        let wanted = if notification { HandlerKind::Notification } else { HandlerKind::Request };
        let Some(entry) = self.lookup(&method).filter(|entry| entry.kind == wanted) else {
            if notification {
                warn!(%method, "rpc: notification for unknown method dropped");
                return None;
            }
            let details = ErrorDetails { message: Some(format!("RPC method {method} is not provided")), ..ErrorDetails::default() };
            return Some(message.error_reply(ErrorType::UnknownMethod, details));
        };

        let ctx = CallContext {
            connection: connection.clone(),
            request_id: message.request_id.clone(),
            method: method.clone(),
            header: message.header.clone(),
            metadata,
        };
        debug!(connection_id = %connection.id(), request_id = %ctx.request_id, %method, "rpc: invoke handler");

        let outcome = invoke(&entry, std::mem::take(&mut message.body), ctx).await;
        if notification {
            if let Outcome::Returned(Err(e)) = &outcome {
                warn!(%method, error = %e, "rpc: notification handler failed");
            }
            return None;
        }

        Some(match outcome {
            Outcome::Returned(Ok(body)) => message.reply(body),
            Outcome::Returned(Err(e)) => message.error_reply(ErrorType::ServerError, e.into_details()),
            Outcome::Panicked(reason) => {
                error!(%method, %reason, "rpc: handler panicked");
                let details = ErrorDetails {
                    class_name: Some("panic".to_owned()),
                    code: None,
                    message: Some(format!("handler for {method} panicked: {reason}")),
                };
                message.error_reply(ErrorType::ServerError, details)
            }
            Outcome::TimedOut(limit) => {
                let details = ErrorDetails {
                    message: Some(format!("method {method} timed out after {}ms", limit.as_millis())),
                    ..ErrorDetails::default()
                };
                message.error_reply(ErrorType::ServerTimeout, details)
            }
        })
    }
}

async fn invoke(entry: &HandlerEntry, body: Vec<u8>, ctx: CallContext) -> Outcome {
    let call = AssertUnwindSafe(entry.handler.handle(body, ctx)).catch_unwind();
    let caught = match entry.options.timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(caught) => caught,
            Err(_) => return Outcome::TimedOut(limit),
        },
        None => call.await,
    };
    match caught {
        Ok(result) => Outcome::Returned(result),
        Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod tests;
