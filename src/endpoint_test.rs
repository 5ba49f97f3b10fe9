use super::*;

use crate::connection::test_helpers::connected_pair;
use crate::dispatcher::{CallContext, METADATA_PEER};
use crate::error::{HandlerError, RpcErrorKind};

async fn echo(body: Vec<u8>, _ctx: CallContext) -> Result<Vec<u8>, HandlerError> {
    Ok(body)
}

async fn slow(body: Vec<u8>, _ctx: CallContext) -> Result<Vec<u8>, HandlerError> {
    tokio::time::sleep(Duration::from_millis(1000)).await;
    Ok(body)
}

/// Client and server endpoints joined by an in-memory connection.
async fn linked() -> (Endpoint, Connection, Endpoint, Connection) {
    let ((client_conn, client_events), (server_conn, server_events)) = connected_pair().await;
    let client = Endpoint::default();
    let server = Endpoint::default();
    client.attach(client_conn.clone(), client_events);
    server.attach(server_conn.clone(), server_events);
    (client, client_conn, server, server_conn)
}

#[tokio::test]
async fn call_round_trips_through_remote_handler() {
    let (client, conn, server, _) = linked().await;
    server.register("ping", echo).expect("register");

    let body = client.call("ping", vec![1, 2, 3], &conn).await.expect("call");
    assert_eq!(body, vec![1, 2, 3]);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn both_sides_can_serve_and_call() {
    let (client, client_conn, server, server_conn) = linked().await;
    server.register("ping", echo).expect("register");
    client.register("pong", echo).expect("register");

    assert_eq!(client.call("ping", vec![1], &client_conn).await, Ok(vec![1]));
    assert_eq!(server.call("pong", vec![2], &server_conn).await, Ok(vec![2]));
}

#[tokio::test]
async fn unknown_method_surfaces_as_unknown_method() {
    let (client, conn, _server, _) = linked().await;

    let err = client.call("foo", vec![], &conn).await.expect_err("unknown");
    assert_eq!(err.kind, RpcErrorKind::UnknownMethod);
    assert!(err.message.contains("foo"));
}

#[tokio::test]
async fn short_timeout_beats_slow_handler_and_late_reply_is_dropped() {
    let (client, conn, server, _) = linked().await;
    server.register("slow", slow).expect("register");
    server.register("ping", echo).expect("register");

    let token = CancellationToken::new();
    let started = tokio::time::Instant::now();
    let err = client
        .call_with_timeout("slow", vec![], &conn, Duration::from_millis(10), &token)
        .await
        .expect_err("timeout");
    assert_eq!(err.kind, RpcErrorKind::ClientTimeout);
    assert!(started.elapsed() < Duration::from_millis(500));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.call("ping", vec![9], &conn).await, Ok(vec![9]));
}

#[tokio::test]
async fn slow_handler_does_not_block_other_requests() {
    let (client, conn, server, _) = linked().await;
    server.register("slow", slow).expect("register");
    server.register("ping", echo).expect("register");

    let slow_call = {
        let client = client.clone();
        let conn = conn.clone();
        tokio::spawn(async move { client.call("slow", vec![1], &conn).await })
    };
    let started = tokio::time::Instant::now();
    assert_eq!(client.call("ping", vec![2], &conn).await, Ok(vec![2]));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(slow_call.await.expect("join"), Ok(vec![1]));
}

#[tokio::test]
async fn metadata_reaches_handlers() {
    let ((client_conn, client_events), (server_conn, server_events)) = connected_pair().await;
    let client = Endpoint::default();
    let server = Endpoint::default();
    client.attach(client_conn.clone(), client_events);
    let metadata: Metadata = Arc::new(HashMap::from([(METADATA_PEER.to_owned(), "node-b".to_owned())]));
    server.attach_with_metadata(server_conn, server_events, metadata);
    server
        .register("whoami", |_body: Vec<u8>, ctx: CallContext| async move {
            Ok::<_, HandlerError>(ctx.peer().unwrap_or_default().as_bytes().to_vec())
        })
        .expect("register");

    assert_eq!(client.call("whoami", vec![], &client_conn).await, Ok(b"node-b".to_vec()));
}

#[tokio::test]
async fn peer_close_rejects_pending_calls() {
    let (client, conn, server, server_conn) = linked().await;
    server.register("slow", slow).expect("register");

    let pending = {
        let client = client.clone();
        let conn = conn.clone();
        tokio::spawn(async move { client.call("slow", vec![], &conn).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server_conn.close(true).await;

    let err = pending.await.expect("join").expect_err("closed");
    assert_eq!(err.kind, RpcErrorKind::ConnectionClosed);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn notify_runs_remote_handler_without_reply() {
    let (client, conn, server, _) = linked().await;
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    server
        .register_notification("gossip", move |body: Vec<u8>, _ctx: CallContext| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(body);
                Ok::<_, HandlerError>(Vec::new())
            }
        })
        .expect("register");

    client.notify("gossip", vec![4, 4], &conn).await.expect("notify");
    let body = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv()).await.expect("timeout");
    assert_eq!(body, Some(vec![4, 4]));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn stop_rejects_pending_and_new_calls() {
    let (client, conn, server, _) = linked().await;
    server.register("slow", slow).expect("register");

    let pending = {
        let client = client.clone();
        let conn = conn.clone();
        tokio::spawn(async move { client.call("slow", vec![], &conn).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.stop();
    client.stop();

    assert_eq!(pending.await.expect("join").expect_err("stopped").kind, RpcErrorKind::Stopped);
    assert_eq!(client.call("slow", vec![], &conn).await.expect_err("stopped").kind, RpcErrorKind::Stopped);
    assert!(client.is_stopped());
}

#[tokio::test]
async fn undecodable_frame_is_dropped_without_killing_delivery() {
    let (client, conn, server, server_conn) = linked().await;
    server.register("ping", echo).expect("register");

    conn.send(vec![0xff, 0xff, 0xff]).await.expect("send garbage");
    assert_eq!(client.call("ping", vec![3], &conn).await, Ok(vec![3]));
    assert!(server_conn.is_open());
}

#[tokio::test]
async fn calling_a_notification_method_fails_fast() {
    let (client, conn, server, _) = linked().await;
    server
        .register_notification("gossip", |_body: Vec<u8>, _ctx: CallContext| async move {
            Ok::<_, HandlerError>(Vec::new())
        })
        .expect("register");

    let token = CancellationToken::new();
    let started = tokio::time::Instant::now();
    let err = client
        .call_with_timeout("gossip", vec![], &conn, Duration::from_millis(500), &token)
        .await
        .expect_err("no request handler");
    assert_eq!(err.kind, RpcErrorKind::UnknownMethod);
    assert!(started.elapsed() < Duration::from_millis(400));
}
