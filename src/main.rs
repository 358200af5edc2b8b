use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshage::{CliHandler, MeshConfig, Node, NodeName, local_hostname};

#[derive(Parser, Debug)]
#[command(name = "meshage")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node name (defaults to the host name).
    #[arg(short, long, env = "MESH_NAME")]
    name: Option<String>,

    #[arg(short, long, env = "MESH_BIND", default_value = "0.0.0.0:9000")]
    bind: SocketAddr,

    /// Address other nodes should dial, repeatable.
    #[arg(short, long, value_name = "HOST:PORT")]
    advertise: Vec<String>,

    /// Target number of outbound links.
    #[arg(long, env = "MESH_DEGREE", default_value = "0")]
    degree: usize,

    /// Request timeout in seconds.
    #[arg(short, long, env = "MESH_TIMEOUT", default_value = "10")]
    timeout: u64,

    /// Seconds between adjacency re-announcements.
    #[arg(short, long, default_value = "10")]
    gossip_interval: u64,

    /// Peers dialed at start-up.
    #[arg(short = 'D', long = "dial", value_name = "HOST", env = "MESH_PEERS", value_delimiter = ',')]
    dial: Vec<String>,

    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let name = args.name.unwrap_or_else(local_hostname);
    let name = NodeName::new(&name).with_context(|| format!("invalid node name {:?}", name))?;
    let config = MeshConfig::new(name)
        .with_bind(args.bind)
        .with_advertise(args.advertise)
        .with_degree(args.degree)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_gossip_interval(Duration::from_secs(args.gossip_interval.max(1)))
        .with_peers(args.dial);

    let peers = config.peers.clone();
    let node = Arc::new(Node::bind(config).await?);
    node.serve(CliHandler::new(node.clone())).await?;
    info!("Node name: {}", node.name());

    for peer in &peers {
        match node.dial(peer).await {
            Ok(name) => info!(peer = %name, "dialed {}", peer),
            Err(e) => warn!(error = %e, "dial {} failed", peer),
        }
    }

    let cli = CliHandler::new(node.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        for response in cli.run_line(&line).await {
                            print!("{}", response);
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        stdin_open = false;
                    }
                }
            }
            _ = interval.tick() => {
                match node.status().await {
                    Ok(status) => info!(
                        mesh_size = status.mesh_size,
                        degree = status.degree,
                        peers = status.peers,
                        "status snapshot"
                    ),
                    Err(e) => warn!(error = %e, "status unavailable"),
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
