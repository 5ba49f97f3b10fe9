//! Error taxonomy for the transport and RPC layers.
//!
//! DESIGN
//! ======
//! Transport failures ([`TransportError`]) surface synchronously from the
//! operation that caused them: connect, send, listener start. Call failures
//! surface as one tagged [`RpcError`] whose [`RpcErrorKind`] callers branch
//! on, with the wire diagnostics (class name, code, message) carried as
//! optional fields. Handlers report failures as [`HandlerError`], which the
//! dispatcher turns into a `SERVER_ERROR` reply.

use std::fmt;

use frames::{CodecError, ErrorDetails, ErrorType};
use uuid::Uuid;

use crate::connection::ConnectionState;

// =============================================================================
// TRANSPORT
// =============================================================================

/// Failure of a connection-level operation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    ConnectFailed { url: String, reason: String },
    #[error("send on connection {connection_id} failed: connection is {state}")]
    SendFailed { connection_id: Uuid, state: ConnectionState },
    #[error("failed to start websocket server on any port in range: {min}-{max}")]
    ServerStartFailed { min: u16, max: u16 },
    #[error("connection {0} closed")]
    ConnectionClosed(Uuid),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("invalid server config: {0}")]
    InvalidConfig(String),
}

impl From<rustls::Error> for TransportError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for TransportError {
    fn from(err: rcgen::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

// =============================================================================
// RPC
// =============================================================================

/// Category of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
    ClientTimeout,
    ServerTimeout,
    UnknownMethod,
    ClientError,
    ServerError,
    Cancelled,
    FailedToParse,
    FailedToSerialize,
    ConnectionClosed,
    Stopped,
}

impl RpcErrorKind {
    /// Wire error type for kinds that can travel in a reply.
    #[must_use]
    pub fn error_type(self) -> Option<ErrorType> {
        match self {
            Self::ClientTimeout => Some(ErrorType::ClientTimeout),
            Self::ServerTimeout => Some(ErrorType::ServerTimeout),
            Self::UnknownMethod => Some(ErrorType::UnknownMethod),
            Self::ClientError => Some(ErrorType::ClientError),
            Self::ServerError => Some(ErrorType::ServerError),
            Self::Cancelled | Self::FailedToParse | Self::FailedToSerialize | Self::ConnectionClosed | Self::Stopped => {
                None
            }
        }
    }
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ClientTimeout => "client timeout",
            Self::ServerTimeout => "server timeout",
            Self::UnknownMethod => "unknown method",
            Self::ClientError => "client error",
            Self::ServerError => "server error",
            Self::Cancelled => "cancelled",
            Self::FailedToParse => "failed to parse",
            Self::FailedToSerialize => "failed to serialize",
            Self::ConnectionClosed => "connection closed",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Failure of one RPC call. Only the call it concerns ever sees it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
    /// Set for `ServerError` replies that named the failing handler error.
    pub class_name: Option<String>,
    /// Set for `ServerError` replies that carried a stable code.
    pub code: Option<String>,
    /// True when the failure came from the transport rather than the remote side.
    transport: bool,
}

impl RpcError {
    #[must_use]
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), class_name: None, code: None, transport: false }
    }

    #[must_use]
    pub fn client_timeout(method: &str, timeout_ms: u128) -> Self {
        Self::new(RpcErrorKind::ClientTimeout, format!("rpc call {method} timed out after {timeout_ms}ms"))
    }

    #[must_use]
    pub fn cancelled(method: &str) -> Self {
        Self::new(RpcErrorKind::Cancelled, format!("rpc call {method} was cancelled"))
    }

    #[must_use]
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self { transport: true, ..Self::new(RpcErrorKind::ConnectionClosed, reason) }
    }

    #[must_use]
    pub fn stopped() -> Self {
        Self::new(RpcErrorKind::Stopped, "rpc communicator stopped")
    }

    /// Map an error reply back into a call failure.
    #[must_use]
    pub fn from_reply(error_type: ErrorType, method: &str, details: &ErrorDetails) -> Self {
        let kind = match error_type {
            ErrorType::ServerTimeout => RpcErrorKind::ServerTimeout,
            ErrorType::ClientTimeout => RpcErrorKind::ClientTimeout,
            ErrorType::UnknownMethod => RpcErrorKind::UnknownMethod,
            ErrorType::ClientError => RpcErrorKind::ClientError,
            ErrorType::ServerError => RpcErrorKind::ServerError,
        };
        let message = details.message.clone().unwrap_or_else(|| match kind {
            RpcErrorKind::UnknownMethod => format!("server does not implement method {method}"),
            RpcErrorKind::ServerTimeout => format!("server timed out on method {method}"),
            _ => format!("rpc call {method} failed"),
        });
        Self { class_name: details.class_name.clone(), code: details.code.clone(), ..Self::new(kind, message) }
    }

    /// Whether a caller may reasonably retry the same call.
    ///
    /// Transport failures and timeouts are retryable; application-level
    /// failures need caller-specific logic.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            RpcErrorKind::ClientTimeout | RpcErrorKind::ServerTimeout | RpcErrorKind::ConnectionClosed => true,
            RpcErrorKind::ClientError => self.transport,
            _ => false,
        }
    }

    /// Wire diagnostics for this error.
    #[must_use]
    pub fn details(&self) -> ErrorDetails {
        ErrorDetails { class_name: self.class_name.clone(), code: self.code.clone(), message: Some(self.message.clone()) }
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        let kind = match err {
            TransportError::ConnectionClosed(_) => RpcErrorKind::ConnectionClosed,
            _ => RpcErrorKind::ClientError,
        };
        Self { transport: true, ..Self::new(kind, err.to_string()) }
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        Self::new(RpcErrorKind::FailedToParse, err.to_string())
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// Grepable code carried by domain errors a handler may return.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    /// Name reported as `errorClassName`. Defaults to the Rust type name.
    fn class_name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// Failure returned by a method handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub class_name: Option<String>,
    pub code: Option<String>,
    pub message: String,
}

impl HandlerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { class_name: None, code: None, message: message.into() }
    }

    /// Build from a domain error implementing [`ErrorCode`].
    #[must_use]
    pub fn from_code(err: &impl ErrorCode) -> Self {
        Self {
            class_name: Some(err.class_name().to_owned()),
            code: Some(err.error_code().to_owned()),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub(crate) fn into_details(self) -> ErrorDetails {
        ErrorDetails { class_name: self.class_name, code: self.code, message: Some(self.message) }
    }
}

/// Raised when a method name already has a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("method {0} is already registered")]
pub struct DuplicateRegistration(pub String);

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
