//! Replicated key-value store node.
//!
//! One consensus server: recovers its log and snapshot from the data
//! directory, joins the configured cluster over TCP, and serves client
//! reads and writes.

use clap::Parser;
use raftkv_core::transport::{self, TcpTransport};
use raftkv_core::{KvStateMachine, Peer, RaftConfig, RaftNode, Service};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Replicated key-value store node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Numeric node id; must appear in the peer list
    #[arg(short, long)]
    id: u64,

    /// Address to listen on for peer and client RPCs
    #[arg(short, long)]
    listen: String,

    /// Cluster members as id=host:port (repeat per member, including self)
    #[arg(short, long = "peer", value_parser = parse_peer)]
    peers: Vec<Peer>,

    /// Data directory for the log and snapshots
    #[arg(short, long, default_value = "./raftkv-data")]
    data_dir: PathBuf,

    /// Election timer base in milliseconds
    #[arg(long, default_value = "300")]
    vote_timeout_ms: u64,

    /// Heartbeat period in milliseconds
    #[arg(long, default_value = "100")]
    keepalive_period_ms: u64,

    /// Log bytes before snapshot compaction kicks in
    #[arg(long, default_value = "16777216")]
    snapshot_min_log_size: u64,

    /// Seconds between snapshot checks
    #[arg(long, default_value = "30")]
    backup_interval_seconds: u64,

    /// Acknowledge writes after local append only (weaker durability)
    #[arg(long)]
    async_write: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_peer(arg: &str) -> Result<Peer, String> {
    let (id, addr) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {arg}"))?;
    let id = id
        .parse()
        .map_err(|_| format!("invalid node id in {arg}"))?;
    Ok(Peer::new(id, addr))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if !args.peers.iter().any(|p| p.id == args.id) {
        return Err(format!("node id {} is not in the peer list", args.id).into());
    }

    info!("raftkv node {} starting on {}", args.id, args.listen);

    let config = RaftConfig {
        data_dir: args.data_dir,
        peers: args.peers,
        vote_timeout: Duration::from_millis(args.vote_timeout_ms),
        keepalive_period: Duration::from_millis(args.keepalive_period_ms),
        snapshot_min_log_size: args.snapshot_min_log_size,
        backup_interval: Duration::from_secs(args.backup_interval_seconds),
        async_write: args.async_write,
        ..RaftConfig::default()
    };

    let state_machine = Arc::new(KvStateMachine::new());
    let tcp = TcpTransport::new(config.keepalive_period.max(config.vote_timeout));
    let node = RaftNode::start(args.id, config, state_machine, tcp).await?;
    let service = Service::new(Arc::clone(&node));

    let shutdown_rx = {
        // The serve loop shares the node's shutdown signal.
        let (tx, rx) = tokio::sync::watch::channel(false);
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            node.shutdown();
            let _ = tx.send(true);
        });
        rx
    };

    let server = transport::serve(&args.listen, service, shutdown_rx).await?;
    server.await?;
    Ok(())
}
