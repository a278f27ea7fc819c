//! lnbridge gRPC server
//!
//! Runs the bridge in front of a node executable: the node is launched on the
//! first Start call and every method in the method table is callable by name.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use lnbridge::node::parse_override;
use lnbridge::{ChildProcessNode, MethodRegistry, NodeConfig, NodePaths};
use lnbridge_grpc::{BridgeServer, BridgeService, BridgeSettings, GrpcBackend, MethodTable};

/// lnbridge gRPC Server - Lightning node RPC by method name
#[derive(Parser, Debug)]
#[command(name = "lnbridge-grpc")]
#[command(about = "gRPC server bridging calls and streams to a Lightning node")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "[::1]:50051")]
    addr: SocketAddr,

    /// Node data directory
    #[arg(long)]
    app_dir: PathBuf,

    /// Bitcoin network (mainnet, testnet, regtest, ...)
    #[arg(long, default_value = "testnet")]
    network: String,

    /// Node executable
    #[arg(long, default_value = "lnd")]
    lnd_bin: PathBuf,

    /// Extra argument passed to the node (repeatable)
    #[arg(long = "lnd-arg", allow_hyphen_values = true)]
    lnd_args: Vec<String>,

    /// Node RPC address
    #[arg(long, default_value = "https://localhost:10009")]
    node_rpc: String,

    /// CA certificate for the node RPC connection (defaults to <app-dir>/tls.cert for https)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// JSON manifest of additional methods
    #[arg(long)]
    methods: Option<PathBuf>,

    /// Node config override as key=value (repeatable)
    #[arg(long = "set", value_parser = parse_set)]
    overrides: Vec<(String, String)>,

    /// Maximum number of unary calls running at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Seconds to wait for the node to accept RPC connections
    #[arg(long, default_value_t = 120)]
    ready_timeout_secs: u64,
}

fn parse_set(raw: &str) -> Result<(String, String), String> {
    parse_override(raw).map_err(|e| e.to_string())
}

/// `host:port` of an RPC URL, for the readiness probe.
fn rpc_authority(url: &str) -> anyhow::Result<String> {
    let uri: tonic::codegen::http::Uri = url.parse().context("invalid --node-rpc")?;
    let authority = uri.authority().context("--node-rpc has no host")?;
    let port = uri.port_u16().unwrap_or(10009);
    Ok(format!("{}:{port}", authority.host()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let mut table = MethodTable::builtin();
    if let Some(path) = &args.methods {
        table.merge_manifest(path)?;
    }

    let tls_cert = match &args.tls_cert {
        Some(path) => Some(path.clone()),
        None if args.node_rpc.starts_with("https://") => Some(args.app_dir.join("tls.cert")),
        None => None,
    };
    let backend = GrpcBackend::connect(&args.node_rpc, tls_cert.as_deref())?;
    let registry = MethodRegistry::register(backend.callables(table.specs())?);
    tracing::info!(methods = registry.len(), "Registered node methods");

    let node = Arc::new(
        ChildProcessNode::new(&args.lnd_bin, rpc_authority(&args.node_rpc)?)
            .ready_timeout(Duration::from_secs(args.ready_timeout_secs)),
    );

    let mut node_config = NodeConfig::default();
    node_config.apply(args.overrides);

    let mut settings = BridgeSettings::new(NodePaths::new(&args.app_dir, &args.network));
    settings.node_config = node_config;
    settings.node_args = args.lnd_args;
    settings.max_concurrent = args.max_concurrent;

    let service = BridgeService::new(registry, node.clone(), settings);
    let result = BridgeServer::new(args.addr, service).run().await;

    node.shutdown().await;
    result?;
    Ok(())
}
