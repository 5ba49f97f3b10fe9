//! meshrpc — request/response RPC over websocket connections between peers.
//!
//! Layers, leaves first:
//! - [`connection`]: one websocket channel moving opaque binary payloads
//! - [`listener`] / [`connector`]: obtain connections (server and client role)
//! - [`frames`]: the protobuf message envelope
//! - [`correlator`]: pending calls, deadlines, cancellation, reply matching
//! - [`dispatcher`]: method registry and handler invocation
//! - [`endpoint`]: one local identity wiring the two above to its connections
//! - [`wait`]: race an event against a timeout and a cancellation token
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use meshrpc::{CallContext, Endpoint, HandlerError, Listener, ServerConfig, connect};
//!
//! let server = Endpoint::default();
//! server.register("ping", |body: Vec<u8>, _ctx: CallContext| async move { Ok::<_, HandlerError>(body) })?;
//! let mut listener = Listener::start(ServerConfig::default()).await?;
//!
//! let client = Endpoint::default();
//! let (conn, events) = connect(&format!("127.0.0.1:{}", listener.port()), false).await?;
//! client.attach(conn.clone(), events);
//! if let Some((inbound, inbound_events)) = listener.accept().await {
//!     server.attach(inbound, inbound_events);
//! }
//! let reply = client.call("ping", vec![1, 2, 3], &conn).await?;
//! assert_eq!(reply, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod connector;
pub mod correlator;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod tls;
pub mod wait;

pub use config::{PortRange, RpcConfig, ServerConfig, TlsCertificateFiles};
pub use connection::{Connection, ConnectionEvent, ConnectionEvents, ConnectionState, Direction, DisconnectReason};
pub use connector::{ConnectOptions, connect, connect_with};
pub use correlator::{Correlator, Routed};
pub use dispatcher::{CallContext, Dispatcher, Handler, METADATA_PEER, Metadata, MethodOptions};
pub use endpoint::Endpoint;
pub use error::{DuplicateRegistration, ErrorCode, HandlerError, RpcError, RpcErrorKind, TransportError};
pub use frames;
pub use listener::Listener;
pub use tokio_util::sync::CancellationToken;
pub use wait::{WaitError, run_and_wait, wait_for, wait_for_condition, wait_for_event};
