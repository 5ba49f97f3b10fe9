//! RPC envelope model and protobuf codec for the websocket transport.
//!
//! Every message exchanged between peers, whether request, reply or
//! notification, is one [`RpcMessage`] encoded as a protobuf record inside a
//! single binary websocket frame. The body is an opaque, already serialized
//! application payload; this crate never looks inside it.
//!
//! INVARIANTS
//! ==========
//! The diagnostic fields (`error_class_name`, `error_code`, `error_message`)
//! only appear alongside an `error_type`. [`decode_message`] rejects envelopes
//! that violate this so downstream code can treat "no error type" as success.

use std::collections::HashMap;

use prost::Message;
use serde::{Deserialize, Serialize};

/// Header key naming the remote method.
pub const HEADER_METHOD: &str = "method";
/// Header key marking a request that expects a reply.
pub const HEADER_REQUEST: &str = "request";
/// Header key marking a reply to an earlier request.
pub const HEADER_RESPONSE: &str = "response";
/// Header key marking a one-way notification.
pub const HEADER_NOTIFICATION: &str = "notification";

/// Error returned by [`decode_message`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireMessage`.
    #[error("failed to decode protobuf message: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `error_type` integer on the wire does not map to a known [`ErrorType`].
    #[error("invalid error type: {0}")]
    InvalidErrorType(i32),
    /// Diagnostic fields were present without an `error_type`.
    #[error("error diagnostics present without an error type")]
    OrphanDiagnostics,
}

/// Structured failure category carried by a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// The server-side handler did not finish within its method timeout.
    ServerTimeout,
    /// The caller gave up waiting.
    ClientTimeout,
    /// No handler is registered for the requested method.
    UnknownMethod,
    /// The request itself was malformed or could not be sent.
    ClientError,
    /// The handler failed.
    ServerError,
}

impl ErrorType {
    /// Convert into the wire enum integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::ServerTimeout => WireErrorType::ServerTimeout as i32,
            Self::ClientTimeout => WireErrorType::ClientTimeout as i32,
            Self::UnknownMethod => WireErrorType::UnknownMethod as i32,
            Self::ClientError => WireErrorType::ClientError as i32,
            Self::ServerError => WireErrorType::ServerError as i32,
        }
    }

    /// Parse from the wire enum integer value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidErrorType`] for out-of-range values.
    pub fn from_i32(value: i32) -> Result<Self, CodecError> {
        match WireErrorType::try_from(value) {
            Ok(WireErrorType::ServerTimeout) => Ok(Self::ServerTimeout),
            Ok(WireErrorType::ClientTimeout) => Ok(Self::ClientTimeout),
            Ok(WireErrorType::UnknownMethod) => Ok(Self::UnknownMethod),
            Ok(WireErrorType::ClientError) => Ok(Self::ClientError),
            Ok(WireErrorType::ServerError) => Ok(Self::ServerError),
            Err(_) => Err(CodecError::InvalidErrorType(value)),
        }
    }
}

/// Error section of a failed reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Kind-specific class name (e.g. the handler's error type).
    pub class_name: Option<String>,
    /// Stable machine-readable code, e.g. `"E_NOT_FOUND"`.
    pub code: Option<String>,
    /// Human readable description.
    pub message: Option<String>,
}

/// A single message on the RPC wire protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMessage {
    /// String headers; the core only interprets the keys defined in this crate.
    pub header: HashMap<String, String>,
    /// Opaque pre-serialized payload.
    pub body: Vec<u8>,
    /// Correlation id shared by a request and its reply.
    pub request_id: String,
    /// Set only on failed replies.
    pub error_type: Option<ErrorType>,
    /// Diagnostics; non-empty only when `error_type` is set.
    #[serde(default, skip_serializing_if = "ErrorDetails::is_empty")]
    pub error: ErrorDetails,
}

impl ErrorDetails {
    /// True when no diagnostic field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.class_name.is_none() && self.code.is_none() && self.message.is_none()
    }
}

impl RpcMessage {
    /// Build a request for `method` carrying `body`.
    #[must_use]
    pub fn request(request_id: impl Into<String>, method: &str, body: Vec<u8>) -> Self {
        let mut header = HashMap::with_capacity(2);
        header.insert(HEADER_REQUEST.to_owned(), HEADER_REQUEST.to_owned());
        header.insert(HEADER_METHOD.to_owned(), method.to_owned());
        Self { header, body, request_id: request_id.into(), ..Self::default() }
    }

    /// Build a one-way notification for `method`.
    #[must_use]
    pub fn notification(request_id: impl Into<String>, method: &str, body: Vec<u8>) -> Self {
        let mut header = HashMap::with_capacity(2);
        header.insert(HEADER_NOTIFICATION.to_owned(), HEADER_NOTIFICATION.to_owned());
        header.insert(HEADER_METHOD.to_owned(), method.to_owned());
        Self { header, body, request_id: request_id.into(), ..Self::default() }
    }

    /// Build a successful reply to `self`.
    #[must_use]
    pub fn reply(&self, body: Vec<u8>) -> Self {
        let mut header = HashMap::with_capacity(2);
        header.insert(HEADER_RESPONSE.to_owned(), HEADER_RESPONSE.to_owned());
        if let Some(method) = self.method() {
            header.insert(HEADER_METHOD.to_owned(), method.to_owned());
        }
        Self { header, body, request_id: self.request_id.clone(), ..Self::default() }
    }

    /// Build a failed reply to `self`.
    #[must_use]
    pub fn error_reply(&self, error_type: ErrorType, error: ErrorDetails) -> Self {
        Self { error_type: Some(error_type), error, ..self.reply(Vec::new()) }
    }

    /// Method named in the header, if any.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.header.get(HEADER_METHOD).map(String::as_str)
    }

    /// True when the message is a request expecting a reply.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.header.contains_key(HEADER_REQUEST)
    }

    /// True when the message is a reply to an earlier request.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.header.contains_key(HEADER_RESPONSE)
    }

    /// True when the message is a one-way notification.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.header.contains_key(HEADER_NOTIFICATION)
    }
}

/// Encode a message into protobuf bytes.
#[must_use]
pub fn encode_message(message: &RpcMessage) -> Vec<u8> {
    let wire = message_to_wire(message);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot hit `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a message.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes,
/// [`CodecError::InvalidErrorType`] for out-of-range error types and
/// [`CodecError::OrphanDiagnostics`] for diagnostics without an error type.
pub fn decode_message(bytes: &[u8]) -> Result<RpcMessage, CodecError> {
    let wire = WireMessage::decode(bytes)?;
    wire_to_message(wire)
}

fn message_to_wire(message: &RpcMessage) -> WireMessage {
    // Diagnostics without an error type would not survive decoding.
    let error = if message.error_type.is_some() { message.error.clone() } else { ErrorDetails::default() };
    WireMessage {
        header: message.header.clone(),
        body: message.body.clone(),
        request_id: message.request_id.clone(),
        error_type: message.error_type.map(ErrorType::as_i32),
        error_class_name: error.class_name,
        error_code: error.code,
        error_message: error.message,
    }
}

fn wire_to_message(wire: WireMessage) -> Result<RpcMessage, CodecError> {
    let error = ErrorDetails {
        class_name: wire.error_class_name,
        code: wire.error_code,
        message: wire.error_message,
    };
    let error_type = wire.error_type.map(ErrorType::from_i32).transpose()?;
    if error_type.is_none() && !error.is_empty() {
        return Err(CodecError::OrphanDiagnostics);
    }

    Ok(RpcMessage {
        header: wire.header,
        body: wire.body,
        request_id: wire.request_id,
        error_type,
        error,
    })
}

#[derive(Clone, PartialEq, Message)]
struct WireMessage {
    #[prost(map = "string, string", tag = "1")]
    header: HashMap<String, String>,
    #[prost(bytes = "vec", tag = "2")]
    body: Vec<u8>,
    #[prost(string, tag = "3")]
    request_id: String,
    #[prost(enumeration = "WireErrorType", optional, tag = "4")]
    error_type: Option<i32>,
    #[prost(string, optional, tag = "5")]
    error_class_name: Option<String>,
    #[prost(string, optional, tag = "6")]
    error_code: Option<String>,
    #[prost(string, optional, tag = "7")]
    error_message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireErrorType {
    ServerTimeout = 0,
    ClientTimeout = 1,
    UnknownMethod = 2,
    ClientError = 3,
    ServerError = 4,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
