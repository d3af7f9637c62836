mod cli;
mod peer_protocol;
mod peers;
mod prelude;
mod swarm;
mod tracker;

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use cli::{Cli, Command, PeerArgs};
use peers::{NodeConfig, PeerNode};
use prelude::*;
use tracker::Tracker;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let matches = Cli::parse();

    match matches.command {
        Command::Tracker { host, port } => run_tracker(host, port).await,
        Command::Peer(args) => run_peer(args).await,
    }
}

async fn run_tracker(host: String, port: u16) -> Result<(), anyhow::Error> {
    let shutdown = CancellationToken::new();
    let tracker = Tracker::bind((host.as_str(), port), shutdown.clone()).await?;
    let server = tokio::spawn(tracker.run());

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down tracker");
    shutdown.cancel();

    server.await??;
    Ok(())
}

async fn run_peer(args: PeerArgs) -> Result<(), anyhow::Error> {
    let tracker_addr = (args.tracker_host, args.tracker_port);
    let config = NodeConfig {
        listen_port: args.listen_port,
        ..NodeConfig::default()
    };

    let node = match (&args.file_path, &args.file_name) {
        (Some(file_path), None) => {
            PeerNode::share_file(tracker_addr, config, file_path.as_ref(), args.block_size).await?
        }
        (None, Some(file_name)) => {
            PeerNode::download_file(tracker_addr, config, file_name, args.block_size).await?
        }
        // clap enforces exactly one of the two
        _ => anyhow::bail!("pass either --file-path or --file-name"),
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut seeding = node.is_complete();
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }

            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                if !seeding && node.is_complete() {
                    info!("download finished, staying up to seed; ctrl-c to exit");
                    seeding = true;
                }
            }
        }
    }

    info!("ctrl-c received, shutting down peer {}", node.peer_id());
    node.shutdown();
    Ok(())
}
