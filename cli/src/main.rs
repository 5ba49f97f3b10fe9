use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use meshrpc::config::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT_MAX, DEFAULT_PORT_MIN, DEFAULT_RPC_TIMEOUT_MS};
use meshrpc::connector::ConnectOptions;
use meshrpc::{
    CallContext, CancellationToken, Connection, DuplicateRegistration, Endpoint, HandlerError, Listener, METADATA_PEER,
    PortRange, RpcConfig, RpcError, ServerConfig, TlsCertificateFiles, TransportError, connect_with,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),
    #[error("{0}")]
    Registration(#[from] DuplicateRegistration),
    #[error("--cert and --key must be given together")]
    HalfCertificatePair,
    #[error("failed to wait for ctrl-c: {0}")]
    Signal(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "meshrpc", about = "Peer RPC over websockets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve `ping` and `methods` until interrupted.
    Serve(ServeArgs),
    /// Call one method and print the reply body.
    Call(CallArgs),
    /// Call `ping` repeatedly and report latency.
    Ping(PingArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "RPC_PORT_MIN", default_value_t = DEFAULT_PORT_MIN)]
    port_min: u16,

    #[arg(long, env = "RPC_PORT_MAX", default_value_t = DEFAULT_PORT_MAX)]
    port_max: u16,

    #[arg(long, env = "RPC_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, env = "RPC_TLS", default_value_t = false)]
    tls: bool,

    #[arg(long, env = "RPC_TLS_CERT", requires = "tls")]
    cert: Option<String>,

    #[arg(long, env = "RPC_TLS_KEY", requires = "tls")]
    key: Option<String>,

    #[arg(long, env = "RPC_MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// `host:port` or a full `ws://` / `wss://` URL.
    address: String,

    #[arg(long, default_value_t = false)]
    tls: bool,

    #[arg(long, env = "RPC_TIMEOUT_MS", default_value_t = DEFAULT_RPC_TIMEOUT_MS)]
    timeout_ms: u64,
}

#[derive(Args, Debug)]
struct CallArgs {
    #[command(flatten)]
    target: TargetArgs,

    method: String,

    #[arg(long, default_value = "", help = "Request body as UTF-8 text")]
    payload: String,

    #[arg(long, default_value_t = false, help = "Validate the payload as JSON and pretty-print the reply")]
    json: bool,
}

#[derive(Args, Debug)]
struct PingArgs {
    #[command(flatten)]
    target: TargetArgs,

    #[arg(long, default_value_t = 4)]
    count: usize,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Call(args) => run_call(args).await,
        Command::Ping(args) => run_ping(args).await,
    }
}

// =============================================================================
// SERVE
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), CliError> {
    let tls_certificate_files = match (args.cert, args.key) {
        (Some(cert), Some(key)) => Some(TlsCertificateFiles { cert: cert.into(), key: key.into() }),
        (None, None) => None,
        _ => return Err(CliError::HalfCertificatePair),
    };
    let config = ServerConfig {
        port_range: PortRange::new(args.port_min, args.port_max),
        bind_address: args.bind,
        enable_tls: args.tls,
        tls_certificate_files,
        max_message_size: Some(args.max_message_size),
    };

    let endpoint = Endpoint::new(RpcConfig::from_env());
    endpoint.register("ping", |body: Vec<u8>, _ctx: CallContext| async move { Ok::<_, HandlerError>(body) })?;
    let mut names = endpoint.dispatcher().methods();
    names.push("methods".to_owned());
    names.sort();
    endpoint.register("methods", move |_body: Vec<u8>, _ctx: CallContext| {
        let listing = serde_json::to_vec(&names).map_err(|e| HandlerError::new(e.to_string()));
        async move { listing }
    })?;

    let mut listener = Listener::start(config).await?;
    println!("listening on {}", listener.url());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Some((connection, events)) = accepted else { break };
                info!(connection_id = %connection.id(), "serve: peer connected");
                let metadata = Arc::new(HashMap::from([(METADATA_PEER.to_owned(), connection.id().to_string())]));
                endpoint.attach_with_metadata(connection, events, metadata);
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    listener.stop().await;
    endpoint.stop();
    Ok(())
}

// =============================================================================
// CLIENT
// =============================================================================

async fn open(target: &TargetArgs) -> Result<(Endpoint, Connection), CliError> {
    let url = meshrpc::connector::target_url(&target.address, target.tls);
    let (connection, events) = connect_with(&url, &ConnectOptions::default()).await?;
    let endpoint = Endpoint::new(RpcConfig { default_timeout: Duration::from_millis(target.timeout_ms) });
    endpoint.attach(connection.clone(), events);
    Ok((endpoint, connection))
}

async fn run_call(args: CallArgs) -> Result<(), CliError> {
    if args.json && !args.payload.is_empty() {
        serde_json::from_str::<serde_json::Value>(&args.payload)?;
    }
    let (endpoint, connection) = open(&args.target).await?;
    let body = endpoint.call(&args.method, args.payload.into_bytes(), &connection).await?;

    if args.json {
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", String::from_utf8_lossy(&body));
    }
    connection.close(true).await;
    Ok(())
}

async fn run_ping(args: PingArgs) -> Result<(), CliError> {
    let (endpoint, connection) = open(&args.target).await?;
    let timeout = Duration::from_millis(args.target.timeout_ms);
    let token = CancellationToken::new();

    for seq in 0..args.count {
        let payload = seq.to_string().into_bytes();
        let started = Instant::now();
        let reply = endpoint.call_with_timeout("ping", payload.clone(), &connection, timeout, &token).await?;
        let elapsed = started.elapsed();
        let status = if reply == payload { "ok" } else { "mismatch" };
        println!("seq={seq} time={:.2}ms {status}", elapsed.as_secs_f64() * 1_000.0);
    }
    connection.close(true).await;
    Ok(())
}
