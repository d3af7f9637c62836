use clap::{self, Args, Parser, Subcommand};

use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Path to a local file to seed, validated at parse time.
#[derive(Debug, Clone)]
pub struct SharedFilePath(PathBuf);

impl SharedFilePath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, anyhow::Error> {
        let path: PathBuf = path.into();

        if !path.is_file() {
            anyhow::bail!("could not find file at {}", path.display());
        }

        Ok(SharedFilePath(path))
    }
}

impl FromStr for SharedFilePath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = PathBuf::from(s);
        Self::new(path)
    }
}

impl AsRef<Path> for SharedFilePath {
    fn as_ref(&self) -> &Path {
        self.0.as_ref()
    }
}

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
/// minibit: cooperative file distribution over a central tracker.
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// start the swarm coordinator.
    Tracker {
        #[arg(long, default_value = "127.0.0.1")]
        /// the host the tracker binds to.
        host: String,

        #[arg(long, default_value = "8000")]
        /// the port the tracker binds to.
        port: u16,
    },

    /// start a peer, either seeding a local file or downloading one by name.
    Peer(PeerArgs),
}

#[derive(Args, Debug)]
pub struct PeerArgs {
    #[arg(long, default_value = "127.0.0.1")]
    /// host of the tracker coordinating the swarm.
    pub tracker_host: String,

    #[arg(long, default_value = "8000")]
    /// port of the tracker coordinating the swarm.
    pub tracker_port: u16,

    #[arg(long, default_value = "0")]
    /// the port on which to listen for other peers; 0 picks a free one.
    pub listen_port: u16,

    #[arg(long, conflicts_with = "file_name", required_unless_present = "file_name")]
    /// path of a local file to seed into the swarm.
    pub file_path: Option<SharedFilePath>,

    #[arg(long)]
    /// name of a file to download from the swarm.
    pub file_name: Option<String>,

    #[arg(long, default_value = "16384")]
    /// size of a block in bytes.
    pub block_size: usize,
}
