pub mod block_manager;
pub mod engine;
pub mod unchoke_manager;

mod link;

pub use engine::PeerNode;

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

pub trait PeerStream: AsyncWrite + AsyncRead + Unpin + Send {}
impl<T: AsyncWrite + AsyncRead + Unpin + Send> PeerStream for T {}

/// Cadences and deadlines of a peer's control loops. The defaults are the
/// production values; tests compress them to keep swarms fast.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// port the peer listens on for inbound links; 0 picks an ephemeral one.
    pub listen_port: u16,
    /// how often the tracker is polled and block requests are issued.
    pub request_interval: Duration,
    /// how often upload permissions are re-evaluated.
    pub unchoke_interval: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// where completed downloads are written.
    pub download_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            request_interval: Duration::from_secs(5),
            unchoke_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            download_dir: PathBuf::from("downloads"),
        }
    }
}
