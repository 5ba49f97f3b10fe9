use super::*;

use crate::connection::ConnectionEvent;
use crate::connector::{ConnectOptions, connect, connect_with};
use crate::dispatcher::CallContext;
use crate::endpoint::Endpoint;
use crate::error::HandlerError;

fn local(config: ServerConfig) -> ServerConfig {
    ServerConfig { bind_address: "127.0.0.1".to_owned(), ..config }
}

fn ephemeral() -> ServerConfig {
    local(ServerConfig::new(PortRange::single(0)))
}

async fn accept(listener: &mut Listener) -> Accepted {
    tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .expect("listener closed")
}

async fn next_event(events: &mut ConnectionEvents) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event timed out")
        .expect("events closed")
}

async fn next_data(events: &mut ConnectionEvents) -> Vec<u8> {
    loop {
        if let ConnectionEvent::Data(bytes) = next_event(events).await {
            return bytes;
        }
    }
}

#[tokio::test]
async fn accepted_side_receives_bytes_intact() {
    let mut listener = Listener::start(ephemeral()).await.expect("start");
    let (client, _client_events) = connect(&format!("127.0.0.1:{}", listener.port()), false).await.expect("connect");
    let (server, mut server_events) = accept(&mut listener).await;

    assert_eq!(server.direction(), Direction::Inbound);
    assert_eq!(next_event(&mut server_events).await, ConnectionEvent::Connected);
    client.send(vec![1, 2, 3]).await.expect("send");
    assert_eq!(next_data(&mut server_events).await, vec![1, 2, 3]);
}

#[tokio::test]
async fn ping_round_trip_over_listener() {
    let mut listener = Listener::start(ephemeral()).await.expect("start");
    let server = Endpoint::default();
    server
        .register("ping", |body: Vec<u8>, _ctx: CallContext| async move { Ok::<_, HandlerError>(body) })
        .expect("register");

    let client = Endpoint::default();
    let (conn, events) = connect(&listener.url(), false).await.expect("connect");
    client.attach(conn.clone(), events);
    let (inbound, inbound_events) = accept(&mut listener).await;
    server.attach(inbound, inbound_events);

    assert_eq!(client.call("ping", vec![1, 2, 3], &conn).await, Ok(vec![1, 2, 3]));
}

#[tokio::test]
async fn scans_past_busy_port_and_fails_when_range_exhausted() {
    let _blocker = std::net::TcpListener::bind(("0.0.0.0", 10000)).expect("block port 10000");

    let mut first = Listener::start(ServerConfig::new(PortRange::new(10000, 10001))).await.expect("start");
    assert_eq!(first.port(), 10001);

    let err = Listener::start(ServerConfig::new(PortRange::single(10001)))
        .await
        .err()
        .expect("port 10001 is taken");
    assert!(matches!(err, TransportError::ServerStartFailed { min: 10001, max: 10001 }));
    assert!(err.to_string().contains("10001-10001"));

    first.stop().await;
}

#[tokio::test]
async fn invalid_config_is_rejected_before_binding() {
    let err = Listener::start(local(ServerConfig::new(PortRange::new(2, 1)))).await.err().expect("inverted range");
    assert!(matches!(err, TransportError::InvalidConfig(_)));
}

#[tokio::test]
async fn oversized_message_closes_connection_with_error() {
    let mut listener = Listener::start(ephemeral().with_max_message_size(16)).await.expect("start");
    let (client, mut client_events) = connect(&listener.url(), false).await.expect("connect");
    let (_server, mut server_events) = accept(&mut listener).await;

    assert_eq!(next_event(&mut server_events).await, ConnectionEvent::Connected);
    client.send(vec![0; 64]).await.expect("send");

    assert!(matches!(next_event(&mut server_events).await, ConnectionEvent::Error(_)));
    assert!(matches!(next_event(&mut server_events).await, ConnectionEvent::Disconnected(reason) if !reason.graceful));
    loop {
        match next_event(&mut client_events).await {
            ConnectionEvent::Disconnected(_) => break,
            ConnectionEvent::Data(_) => panic!("no data should reach the client"),
            ConnectionEvent::Connected | ConnectionEvent::Error(_) => {}
        }
    }
}

#[tokio::test]
async fn tls_with_generated_certificate_round_trips() {
    let mut listener = Listener::start(ephemeral().with_tls(None)).await.expect("start tls");
    assert!(listener.is_tls());
    assert!(listener.url().starts_with("wss://"));

    let (client, _client_events) = connect(&listener.url(), true).await.expect("connect tls");
    let (_server, mut server_events) = accept(&mut listener).await;
    client.send(vec![7, 8, 9]).await.expect("send");
    assert_eq!(next_data(&mut server_events).await, vec![7, 8, 9]);
}

#[tokio::test]
async fn silent_tls_client_does_not_block_other_handshakes() {
    let mut listener = Listener::start(ephemeral().with_tls(None)).await.expect("start tls");
    let _silent = tokio::net::TcpStream::connect(("127.0.0.1", listener.port())).await.expect("tcp connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let options = ConnectOptions { timeout: Duration::from_secs(3), ..ConnectOptions::default() };
    let (client, _client_events) = connect_with(&listener.url(), &options).await.expect("connect past silent peer");
    let (_server, mut server_events) = accept(&mut listener).await;
    client.send(vec![1]).await.expect("send");
    assert_eq!(next_data(&mut server_events).await, vec![1]);
}

#[tokio::test]
async fn stop_releases_tls_port() {
    let mut listener = Listener::start(ephemeral().with_tls(None)).await.expect("start tls");
    let port = listener.port();
    listener.stop().await;
    let rebound = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
    assert!(rebound.is_ok(), "port {port} should be free after stop");
}

#[tokio::test]
async fn verified_tls_rejects_generated_certificate() {
    let listener = Listener::start(ephemeral().with_tls(None)).await.expect("start tls");
    let options = ConnectOptions { accept_self_signed: false, ..ConnectOptions::default() };
    let err = connect_with(&listener.url(), &options).await.err().expect("untrusted certificate");
    assert!(matches!(err, TransportError::ConnectFailed { .. }));
}

#[tokio::test]
async fn stop_releases_port_but_keeps_accepted_connections() {
    let mut listener = Listener::start(ephemeral()).await.expect("start");
    let port = listener.port();
    let (client, _client_events) = connect(&listener.url(), false).await.expect("connect");
    let (server, mut server_events) = accept(&mut listener).await;

    listener.stop().await;
    let rebound = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
    assert!(rebound.is_ok(), "port {port} should be free after stop");

    assert!(server.is_open());
    client.send(vec![5]).await.expect("send after stop");
    assert_eq!(next_data(&mut server_events).await, vec![5]);
}
