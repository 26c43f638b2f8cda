use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use raft_lite::config::{parse_peers, NodeConfig};
use raft_lite::node::Node;
use raft_lite::raft::CommitEntry;
use raft_lite::shutdown::install_shutdown_handler;
use raft_lite::transport::LocalNetwork;
use raft_lite::RaftError;

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(version)]
#[command(about = "Raft consensus: leader election, log replication and ordered commits")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one cluster member over TCP. Lines read from stdin are submitted as commands.
    Server(ServerArgs),

    /// Run a whole cluster in-process and replicate a few commands
    Local(LocalArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for Raft RPCs
    #[arg(long, default_value = "7001")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:7002,3:127.0.0.1:7003"
    #[arg(long, default_value = "")]
    peers: String,

    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,
}

#[derive(Parser, Debug)]
struct LocalArgs {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// How long to keep the cluster running
    #[arg(long, default_value = "3")]
    run_secs: u64,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let mut config = NodeConfig::new(args.node_id, listen_addr);
    config.peers = parse_peers(&args.peers)?;
    config.election_timeout_min_ms = args.election_timeout_min_ms;
    config.election_timeout_max_ms = args.election_timeout_max_ms;
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;

    tracing::info!(
        node_id = config.node_id,
        addr = %config.listen_addr,
        peers = config.peers.len(),
        "Starting raft-lite server"
    );

    let shutdown = install_shutdown_handler()?;
    let (commit_tx, mut commit_rx) = mpsc::channel::<CommitEntry<String>>(1024);
    let tcp = Node::bind_tcp(config, commit_tx).await?;
    tcp.node.start().await;

    let node = Arc::clone(&tcp.node);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(entry) = commit_rx.recv() => {
                tracing::info!(index = entry.index, term = entry.term, command = %entry.command, "Committed");
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let command = line.trim().to_string();
                    if command.is_empty() {
                        continue;
                    }
                    match node.propose(command).await {
                        Ok(index) => tracing::info!(index, "Command accepted"),
                        Err(RaftError::NotLeader(leader)) => {
                            tracing::warn!(leader = ?leader, "Not the leader, command dropped");
                        }
                        Err(e) => tracing::warn!(error = %e, "Command rejected"),
                    }
                }
                None => stdin_open = false,
            },
        }
    }

    tcp.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

// =============================================================================
// In-process cluster
// =============================================================================

async fn run_local(args: LocalArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ids: Vec<u64> = (1..=args.nodes).collect();
    let network = LocalNetwork::<String>::new();
    let (commit_tx, mut commit_rx) = mpsc::channel::<(u64, CommitEntry<String>)>(1024);

    let mut nodes = Vec::with_capacity(ids.len());
    for &id in &ids {
        let mut config = NodeConfig::new(id, SocketAddr::from(([127, 0, 0, 1], 0)));
        for &peer in ids.iter().filter(|&&p| p != id) {
            config = config.with_peer(peer, format!("local-{peer}"));
        }

        let (node_tx, mut node_rx) = mpsc::channel(256);
        let node = Node::new(config, network.transport(id), node_tx)?;
        network.register(id, node.clone()).await;

        let commit_tx = commit_tx.clone();
        tokio::spawn(async move {
            while let Some(entry) = node_rx.recv().await {
                if commit_tx.send((id, entry)).await.is_err() {
                    break;
                }
            }
        });
        nodes.push(node);
    }
    drop(commit_tx);

    for node in &nodes {
        node.start().await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.run_secs);
    let mut submitted = 0usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            Some((id, entry)) = commit_rx.recv() => {
                tracing::info!(node_id = id, index = entry.index, term = entry.term, command = %entry.command, "Committed");
            }
            _ = ticker.tick() => {
                for node in &nodes {
                    if node.submit(format!("cmd-{submitted}")).await {
                        tracing::info!(node_id = node.id(), command = submitted, "Submitted");
                        submitted += 1;
                        break;
                    }
                }
            }
        }
    }

    for node in &nodes {
        let status = node.status().await;
        tracing::info!(
            node_id = status.id,
            role = %status.role,
            term = status.term,
            commit_index = ?status.commit_index,
            "Final status"
        );
        node.shutdown().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Local(local_args) => run_local(local_args).await?,
    }

    Ok(())
}
