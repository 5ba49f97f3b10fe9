//! Correlator — pending-call table matching replies to outstanding calls.
//!
//! DESIGN
//! ======
//! Each outstanding call owns one entry in a mutex-guarded map keyed by
//! request id. The entry holds the sending half of a oneshot; the caller
//! races the receiving half and the connection closing through
//! [`wait_for`], which adds the deadline and the call's cancellation token.
//!
//! SETTLEMENT
//! ==========
//! Removing the entry from the table is what settles a call. Whoever removes
//! it (reply routing, connection failure, stop, or the caller's own timer or
//! token) decides the outcome; every later attempt finds nothing and is a
//! no-op. When the caller's local watcher fires but the entry is already
//! gone, the remover has already written the oneshot and the caller takes
//! that value instead. Dropping an in-flight call future removes its entry.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use frames::{RpcMessage, encode_message};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::RpcError;
use crate::wait::{WaitError, wait_for};

type Settlement = Result<Vec<u8>, RpcError>;

/// What the call's own watchers saw, before the deadline and token.
enum CallOutcome {
    Settled(Settlement),
    ConnectionClosed,
}

struct PendingCall {
    connection_id: Uuid,
    method: String,
    settle: oneshot::Sender<Settlement>,
}

/// Outcome of offering an inbound message to the correlator.
#[derive(Debug)]
pub enum Routed {
    /// The message settled a pending call.
    Settled,
    /// A reply whose call already settled (timed out, cancelled, closed). Dropped.
    Late,
    /// The correlator is stopped; inbound traffic is ignored.
    Ignored,
    /// Not a reply; hand it to the dispatcher.
    NotReply(RpcMessage),
}

/// Pending-call table for one endpoint.
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingCall>>,
    stopped: AtomicBool,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the entry when the call future is dropped before settling.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.take(self.request_id);
    }
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()), stopped: AtomicBool::new(false) }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCall>> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of calls awaiting settlement.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Insert a pending entry under a fresh request id.
    fn register(&self, connection_id: Uuid, method: &str, settle: oneshot::Sender<Settlement>) -> String {
        let mut table = self.table();
        loop {
            let request_id = Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = table.entry(request_id.clone()) {
                slot.insert(PendingCall { connection_id, method: method.to_owned(), settle });
                return request_id;
            }
        }
    }

    fn take(&self, request_id: &str) -> Option<PendingCall> {
        self.table().remove(request_id)
    }

    /// Call `method` on the peer behind `connection`.
    ///
    /// # Errors
    ///
    /// Exactly one of: the remote error mapped from the reply, `ClientTimeout`
    /// when `timeout` elapses, `Cancelled` when `token` fires,
    /// `ConnectionClosed` when the connection closes first, `ClientError` when
    /// the request cannot be sent, `Stopped` after [`Correlator::stop`].
    pub async fn call(
        &self,
        method: &str,
        payload: Vec<u8>,
        connection: &Connection,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, RpcError> {
        if self.is_stopped() {
            return Err(RpcError::stopped());
        }
        if token.is_cancelled() {
            return Err(RpcError::cancelled(method));
        }

        let (tx, mut rx) = oneshot::channel();
        let request_id = self.register(connection.id(), method, tx);
        let _guard = PendingGuard { correlator: self, request_id: &request_id };

        let message = RpcMessage::request(request_id.as_str(), method, payload);
        debug!(connection_id = %connection.id(), %request_id, method, "rpc: send request");
        if let Err(e) = connection.send(encode_message(&message)).await {
            warn!(connection_id = %connection.id(), %request_id, method, error = %e, "rpc: request send failed");
            self.take(&request_id);
            return Err(e.into());
        }

        let outcome = async {
            tokio::select! {
                biased;
                settled = &mut rx => CallOutcome::Settled(settled.unwrap_or_else(|_| Err(RpcError::stopped()))),
                () = connection.closed() => CallOutcome::ConnectionClosed,
            }
        };
        let local = match wait_for(outcome, Some(timeout), Some(token)).await {
            Ok(CallOutcome::Settled(settled)) => return settled,
            Ok(CallOutcome::ConnectionClosed) => {
                RpcError::connection_closed(format!("connection {} closed", connection.id()))
            }
            Err(WaitError::TimedOut(_)) => RpcError::client_timeout(method, timeout.as_millis()),
            Err(WaitError::Cancelled | WaitError::SourceClosed) => RpcError::cancelled(method),
        };

        if self.take(&request_id).is_some() {
            debug!(%request_id, method, kind = %local.kind, "rpc: settled locally");
            return Err(local);
        }
        // Another party removed the entry first and has written the oneshot.
        match rx.try_recv() {
            Ok(settled) => settled,
            Err(_) => Err(local),
        }
    }

    /// Send a one-way notification. Nothing is registered.
    ///
    /// # Errors
    ///
    /// `Stopped` after [`Correlator::stop`]; `ClientError` when sending fails.
    pub async fn notify(&self, method: &str, payload: Vec<u8>, connection: &Connection) -> Result<(), RpcError> {
        if self.is_stopped() {
            return Err(RpcError::stopped());
        }
        let message = RpcMessage::notification(Uuid::new_v4().to_string(), method, payload);
        debug!(connection_id = %connection.id(), request_id = %message.request_id, method, "rpc: send notification");
        connection.send(encode_message(&message)).await.map_err(RpcError::from)
    }

    /// Offer an inbound message. Replies settle their call; everything else
    /// is returned for dispatch.
    pub fn route(&self, message: RpcMessage) -> Routed {
        if self.is_stopped() {
            return Routed::Ignored;
        }
        if message.is_request() || message.is_notification() {
            return Routed::NotReply(message);
        }

        let Some(call) = self.take(&message.request_id) else {
            if message.is_response() {
                info!(request_id = %message.request_id, method = ?message.method(), "rpc: discarding reply to settled call");
                return Routed::Late;
            }
            return Routed::NotReply(message);
        };

        let settled = match message.error_type {
            None => Ok(message.body),
            Some(error_type) => Err(RpcError::from_reply(error_type, &call.method, &message.error)),
        };
        debug!(request_id = %message.request_id, method = %call.method, ok = settled.is_ok(), "rpc: reply matched");
        // The caller may have dropped its future; nothing left to notify then.
        let _ = call.settle.send(settled);
        Routed::Settled
    }

    /// Reject every call waiting on `connection_id`. Returns how many settled.
    pub fn fail_connection(&self, connection_id: Uuid) -> usize {
        let failed: Vec<PendingCall> = {
            let mut table = self.table();
            let ids: Vec<String> =
                table.iter().filter(|(_, call)| call.connection_id == connection_id).map(|(id, _)| id.clone()).collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        let count = failed.len();
        for call in failed {
            let _ = call.settle.send(Err(RpcError::connection_closed("peer disconnected")));
        }
        if count > 0 {
            info!(%connection_id, count, "rpc: rejected pending calls for disconnected peer");
        }
        count
    }

    /// Reject all pending calls and refuse new ones. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<PendingCall> = self.table().drain().map(|(_, call)| call).collect();
        info!(count = drained.len(), "rpc: correlator stopped");
        for call in drained {
            let _ = call.settle.send(Err(RpcError::stopped()));
        }
    }
}

#[cfg(test)]
#[path = "correlator_test.rs"]
mod tests;
