//! # MeshRPC CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Host the echo service on a fixed port, tagged as a canary
//! meshrpc serve -p 4801 --tag version=canary
//!
//! # Call it (outputs raw JSON, one line per response)
//! meshrpc call 127.0.0.1:4801 io.meshrpc.Echo/echo -d '{"hello": "joe"}'
//!
//! # Stream three elements
//! meshrpc call 127.0.0.1:4801 io.meshrpc.Echo/repeat --mode request-stream \
//!     -d '{"text": "hi", "count": 3}'
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use meshrpc_cli::demo::EchoService;
use meshrpc_cli::invoke::{self, CallRequest};
use meshrpc_common::transport::TcpClientTransport;
use meshrpc_common::{CommunicationMode, Qualifier};
use meshrpc_server::{NodeConfig, ServiceNode};

#[derive(FromArgs)]
/// MeshRPC - location-transparent microservices RPC
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// Arguments for hosting the demo service.
///
/// The node prints the metadata it would announce to the cluster; feed it
/// to whatever gossip layer is in use.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// host the io.meshrpc.Echo demo service
struct ServeArgs {
    /// host to bind to
    #[argh(option, default = "\"127.0.0.1\".into()")]
    host: String,

    /// port to bind to
    ///
    /// Defaults to 0, which picks a free port. The bound address is logged.
    #[argh(option, short = 'p', default = "0")]
    port: u16,

    /// endpoint tag as key=value, may be repeated
    #[argh(option, long = "tag")]
    tags: Vec<String>,
}

/// Arguments for a single call.
///
/// Output is raw JSON on stdout, one line per response element. Errors go
/// to stderr with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a qualifier on an endpoint
struct CallArgs {
    /// endpoint serving the qualifier, as host:port
    #[argh(positional)]
    endpoint: String,

    /// qualifier to call, as service/method
    #[argh(positional)]
    qualifier: String,

    /// JSON payload, defaults to null
    #[argh(option, short = 'd', long = "data", default = "\"null\".into()")]
    data: String,

    /// communication mode: fire-and-forget, one-way, request-response or
    /// request-stream
    #[argh(option, long = "mode", default = "\"request-response\".into()")]
    mode: String,

    /// call timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "30000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep `call` output clean for piping.
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = NodeConfig::default().with_host(args.host).with_port(args.port);
    for tag in &args.tags {
        let (key, value) = parse_tag(tag)?;
        config = config.with_tag(key, value);
    }

    let node = ServiceNode::builder()
        .config(config)
        .service(Arc::new(EchoService))
        .start()
        .await?;

    tracing::info!("Serving {} on {}", meshrpc_cli::demo::SERVICE_NAME, node.address());
    let mut metadata: Vec<_> = node.metadata().into_iter().collect();
    metadata.sort();
    for (key, value) in metadata {
        tracing::info!("Announce {} = {}", key, value);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    node.shutdown();
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let data: serde_json::Value =
        serde_json::from_str(&args.data).map_err(|e| anyhow::anyhow!("Invalid JSON in data: {}", e))?;
    let mode: CommunicationMode = args.mode.parse()?;
    let qualifier = Qualifier::parse(&args.qualifier)?;

    let request = CallRequest {
        endpoint: args.endpoint,
        qualifier,
        data,
        mode,
        timeout: Duration::from_millis(args.timeout_ms),
    };
    let values = invoke::call(request, Arc::new(TcpClientTransport::default())).await?;

    for value in values {
        println!("{}", serde_json::to_string(&value)?);
    }
    Ok(())
}

fn parse_tag(tag: &str) -> Result<(&str, &str)> {
    tag.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Invalid tag '{}': expected key=value", tag))
}
