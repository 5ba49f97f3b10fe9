//! Wait primitives — race an event against a timeout and a cancellation token.
//!
//! DESIGN
//! ======
//! Every helper here is a `select!` over at most three watchers: the awaited
//! event, an optional deadline, and an optional [`CancellationToken`]. The
//! first to complete settles the wait; the others are dropped together with
//! the `select!`, so a losing timer or token can never fire afterwards.
//!
//! The correlator runs each call's race through [`wait_for`]; the other
//! helpers serve collaborators that wait for a peer or connection to reach a
//! state.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("wait timed out after {0:?}")]
    TimedOut(Duration),
    #[error("wait was cancelled")]
    Cancelled,
    /// The event source closed before a matching event arrived.
    #[error("event source closed")]
    SourceClosed,
}

/// Resolve with `fut`'s output unless the timeout or the token wins first.
///
/// # Errors
///
/// [`WaitError::TimedOut`] when `timeout` elapses first and
/// [`WaitError::Cancelled`] when `token` fires first. A token that is already
/// cancelled wins even against a ready future.
pub async fn wait_for<F>(fut: F, timeout: Option<Duration>, token: Option<&CancellationToken>) -> Result<F::Output, WaitError>
where
    F: Future,
{
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match token {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        () = cancelled => Err(WaitError::Cancelled),
        () = deadline => Err(WaitError::TimedOut(timeout.unwrap_or_default())),
        out = fut => Ok(out),
    }
}

/// Source of events that [`wait_for_event`] can drain.
pub trait EventSource<T> {
    /// Next event, or `None` once the source is closed.
    fn next_event(&mut self) -> impl Future<Output = Option<T>> + Send;
}

impl<T: Send> EventSource<T> for mpsc::Receiver<T> {
    fn next_event(&mut self) -> impl Future<Output = Option<T>> + Send {
        self.recv()
    }
}

impl<T: Send> EventSource<T> for mpsc::UnboundedReceiver<T> {
    fn next_event(&mut self) -> impl Future<Output = Option<T>> + Send {
        self.recv()
    }
}

impl<T: Clone + Send> EventSource<T> for broadcast::Receiver<T> {
    async fn next_event(&mut self) -> Option<T> {
        loop {
            match self.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl EventSource<crate::connection::ConnectionEvent> for crate::connection::ConnectionEvents {
    fn next_event(&mut self) -> impl Future<Output = Option<crate::connection::ConnectionEvent>> + Send {
        self.recv()
    }
}

/// Wait for the first event from `source` accepted by `predicate`.
///
/// Events rejected by the predicate are consumed and dropped.
///
/// # Errors
///
/// See [`wait_for`]; additionally [`WaitError::SourceClosed`] when the source
/// ends without a match.
pub async fn wait_for_event<T, S, P>(
    source: &mut S,
    mut predicate: P,
    timeout: Option<Duration>,
    token: Option<&CancellationToken>,
) -> Result<T, WaitError>
where
    S: EventSource<T>,
    P: FnMut(&T) -> bool,
{
    let matching = async {
        while let Some(event) = source.next_event().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    };
    wait_for(matching, timeout, token).await?.ok_or(WaitError::SourceClosed)
}

/// Poll `condition` every `retry_interval` until it holds. Intervals below
/// [`MIN_RETRY_INTERVAL`] are raised to it.
///
/// # Errors
///
/// See [`wait_for`].
pub async fn wait_for_condition<C>(
    mut condition: C,
    timeout: Option<Duration>,
    retry_interval: Duration,
    token: Option<&CancellationToken>,
) -> Result<(), WaitError>
where
    C: FnMut() -> bool,
{
    let polling = async {
        let mut ticker = tokio::time::interval(retry_interval.max(MIN_RETRY_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if condition() {
                return;
            }
        }
    };
    wait_for(polling, timeout, token).await
}

/// Start `waiter` before running `operation`, so events the operation
/// triggers cannot slip past, then wait for both.
///
/// # Errors
///
/// Returns the waiter's error; the operation's output is returned alongside
/// the waiter's on success.
pub async fn run_and_wait<O, W, T>(operation: O, waiter: W) -> Result<(O::Output, T), WaitError>
where
    O: Future,
    W: Future<Output = Result<T, WaitError>>,
{
    let (waited, output) = tokio::join!(waiter, operation);
    waited.map(|value| (output, value))
}

#[cfg(test)]
#[path = "wait_test.rs"]
mod tests;
