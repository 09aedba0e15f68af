use clap::{Parser, Subcommand};
use labshare::{
    setup_logging, Config, DiskSink, Node, NodeEvent, Result, Role, UdpTransport,
};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(name = "labshare")]
#[command(about = "Distribute files from one teacher machine to a classroom LAN")]
#[command(version)]
struct Cli {
    /// JSON config file; flags below override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// UDP port shared by every node of the session
    #[arg(short, long, global = true)]
    port: Option<u16>,
    /// Node name shown to peers
    #[arg(short, long, global = true)]
    name: Option<String>,
    /// Pre-shared session secret
    #[arg(short, long, global = true)]
    secret: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share files as the session source
    Teach {
        /// Files to share
        #[arg(short, long, required = true, num_args = 1..)]
        file: Vec<PathBuf>,
    },
    /// Join as a consumer and download everything the source shares
    Learn {
        /// Directory completed files are written to
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(name) = cli.name {
        config.node_name = name;
    }
    if let Some(secret) = cli.secret {
        config.session_secret = secret;
    }

    let role = match &cli.command {
        Commands::Teach { .. } => Role::Source,
        Commands::Learn { out } => {
            if let Some(out) = out {
                config.download_dir = out.clone();
            }
            Role::Consumer
        }
    };

    let transport = Arc::new(UdpTransport::bind(&config)?);
    let sink = Arc::new(DiskSink::new(config.download_dir.clone()));
    let (node, events) = Node::new(config, role, transport, sink)?;
    node.start().await?;

    if let Commands::Teach { file } = &cli.command {
        for path in file {
            match node.share_file(path).await {
                Ok(descriptor) => info!(
                    "Shared {} ({} bytes) as {}",
                    descriptor.name, descriptor.size, descriptor.file_id
                ),
                Err(e) => error!("Failed to share {}: {}", path.display(), e),
            }
        }
    }

    tokio::spawn(log_events(events));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    node.log_summary().await;
    node.shutdown().await;

    Ok(())
}

async fn log_events(mut events: UnboundedReceiver<NodeEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::PeerDiscovered {
                peer_id,
                role,
                address,
            } => info!("Peer {} ({}) joined from {}", peer_id.short(), role, address),
            NodeEvent::PeerLost { peer_id } => info!("Peer {} left", peer_id.short()),
            NodeEvent::SourceFound { peer_id, name, .. } => {
                info!("Found source {} ({})", name, peer_id.short())
            }
            NodeEvent::FileAvailable { file_id, name, size } => {
                info!("{} available: {} ({} bytes)", file_id, name, size)
            }
            NodeEvent::DownloadProgress {
                file_id,
                received,
                total,
            } => info!("{}: {}/{} chunks", file_id, received, total),
            NodeEvent::DownloadComplete { file_id, location } => {
                info!("{} saved to {}", file_id, location.display())
            }
            NodeEvent::DownloadFailed { file_id, reason } => {
                error!("{} failed: {}", file_id, reason)
            }
        }
    }
}
