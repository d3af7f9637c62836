pub mod client;
pub mod protocol;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::prelude::*;
use crate::swarm::{BlockId, FileName, PeerId};
use protocol::{PeerAddress, PeerEntry, TrackerCommand, TrackerResponse};

pub use client::TrackerClient;

#[derive(Debug, Clone)]
struct PeerRecord {
    address: PeerAddress,
    blocks: HashSet<BlockId>,
}

// {file_name: {peer_id: record}}; every access goes through the one mutex.
type SwarmMap = HashMap<FileName, HashMap<PeerId, PeerRecord>>;

/// The swarm coordinator. Accepts TCP connections from peers and serves the
/// REGISTER / GET_PEERS / UPDATE_BLOCKS commands over length prefixed JSON.
pub struct Tracker {
    listener: TcpListener,
    state: Arc<Mutex<SwarmMap>>,
    shutdown: CancellationToken,
}

impl Tracker {
    pub async fn bind(addr: impl ToSocketAddrs, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind the tracker listener")?;

        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(SwarmMap::new())),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[instrument(name = "tracker", skip_all)]
    pub async fn run(self) -> anyhow::Result<()> {
        info!("serving on {}", self.listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, closing listener");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("failed to accept connection: {err}");
                            continue;
                        }
                    };

                    debug!("new connection from {addr}");
                    let state = Arc::clone(&self.state);
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(handle_client(socket, addr, state, shutdown));
                }
            }
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    state: Arc<Mutex<SwarmMap>>,
    shutdown: CancellationToken,
) {
    let mut session_peer = None;

    if let Err(err) = serve_session(socket, &state, &shutdown, &mut session_peer).await {
        // a dirty exit (socket error or garbage on the wire) invalidates
        // everything this session registered; clean EOF keeps it.
        warn!("session with {addr} ended with error: {err:#}");
        if let Some(peer_id) = session_peer {
            remove_peer(&state, &peer_id);
            info!("removed {peer_id} from all file entries");
        }
    }
}

async fn serve_session(
    socket: TcpStream,
    state: &Mutex<SwarmMap>,
    shutdown: &CancellationToken,
    session_peer: &mut Option<PeerId>,
) -> anyhow::Result<()> {
    let mut frames = protocol::server_frames(socket);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),

            frame = frames.next() => {
                let command = match frame {
                    None => return Ok(()), // client closed cleanly
                    Some(frame) => frame?,
                };

                if let Some(peer_id) = command.peer_id() {
                    *session_peer = Some(peer_id.clone());
                }

                let response = process_command(state, command);
                frames.send(response).await?;
            }
        }
    }
}

fn process_command(state: &Mutex<SwarmMap>, command: TrackerCommand) -> TrackerResponse {
    let mut swarms = lock_state(state);

    type TC = TrackerCommand;
    match command {
        TC::Register {
            peer_id,
            file_name,
            address,
            blocks,
        } => {
            // a peer participates in one swarm at a time
            for peers in swarms.values_mut() {
                peers.remove(&peer_id);
            }

            let block_count = blocks.len();
            swarms.entry(file_name.clone()).or_default().insert(
                peer_id.clone(),
                PeerRecord {
                    address,
                    blocks: blocks.into_iter().collect(),
                },
            );

            info!("registered {peer_id} for '{file_name}' with {block_count} blocks");
            TrackerResponse::ok()
        }

        TC::GetPeers { peer_id, file_name } => {
            let peers: Vec<PeerEntry> = swarms
                .get(&file_name)
                .map(|peers| {
                    peers
                        .iter()
                        .filter(|(id, _)| **id != peer_id)
                        .map(|(id, record)| PeerEntry {
                            peer_id: id.clone(),
                            address: record.address.clone(),
                            blocks: record.blocks.iter().copied().collect(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            debug!("sending {} peers to {peer_id} for '{file_name}'", peers.len());
            TrackerResponse::with_peers(peers)
        }

        TC::UpdateBlocks {
            peer_id,
            file_name,
            blocks,
        } => match swarms
            .get_mut(&file_name)
            .and_then(|peers| peers.get_mut(&peer_id))
        {
            Some(record) => {
                record.blocks = blocks.into_iter().collect();
                TrackerResponse::ok()
            }
            None => TrackerResponse::error("unknown_peer"),
        },

        TC::Unknown => TrackerResponse::error("unknown_command"),
    }
}

fn remove_peer(state: &Mutex<SwarmMap>, peer_id: &PeerId) {
    let mut swarms = lock_state(state);
    for peers in swarms.values_mut() {
        peers.remove(peer_id);
    }
    swarms.retain(|_, peers| !peers.is_empty());
}

fn lock_state(state: &Mutex<SwarmMap>) -> MutexGuard<'_, SwarmMap> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
