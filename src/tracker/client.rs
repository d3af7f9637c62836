use std::time::Duration;

use anyhow::Context;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_stream::StreamExt;

use super::protocol::{self, PeerAddress, PeerEntry, TrackerCommand};
use crate::prelude::*;
use crate::swarm::{BlockId, PeerId};

/// Client side of the tracker protocol. Each command opens a fresh
/// connection, sends one frame and reads one response, so a failure never
/// poisons later cycles.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    tracker_addr: (String, u16),
    peer_id: PeerId,
    connect_timeout: Duration,
}

impl TrackerClient {
    pub fn new(tracker_addr: (String, u16), peer_id: PeerId, connect_timeout: Duration) -> Self {
        Self {
            tracker_addr,
            peer_id,
            connect_timeout,
        }
    }

    pub async fn register(
        &self,
        file_name: &str,
        address: PeerAddress,
        blocks: Vec<BlockId>,
    ) -> anyhow::Result<()> {
        debug!("registering with tracker for '{file_name}'");
        let response = self
            .send_command(TrackerCommand::Register {
                peer_id: self.peer_id.clone(),
                file_name: file_name.to_string(),
                address,
                blocks,
            })
            .await?;

        response.into_result().map(|_| ())
    }

    pub async fn get_peers(&self, file_name: &str) -> anyhow::Result<Vec<PeerEntry>> {
        let response = self
            .send_command(TrackerCommand::GetPeers {
                peer_id: self.peer_id.clone(),
                file_name: file_name.to_string(),
            })
            .await?;

        Ok(response.into_result()?.unwrap_or_default())
    }

    pub async fn update_blocks(
        &self,
        file_name: &str,
        blocks: Vec<BlockId>,
    ) -> anyhow::Result<()> {
        let response = self
            .send_command(TrackerCommand::UpdateBlocks {
                peer_id: self.peer_id.clone(),
                file_name: file_name.to_string(),
                blocks,
            })
            .await?;

        response.into_result().map(|_| ())
    }

    async fn send_command(
        &self,
        command: TrackerCommand,
    ) -> anyhow::Result<protocol::TrackerResponse> {
        let (host, port) = &self.tracker_addr;
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((host.as_str(), *port)),
        )
        .await
        .context("timed out connecting to tracker")?
        .with_context(|| format!("failed to connect to tracker at {host}:{port}"))?;

        let mut frames = protocol::client_frames(stream);
        frames.send(command).await?;

        match frames.next().await {
            Some(response) => Ok(response?),
            None => anyhow::bail!("tracker closed the connection before responding"),
        }
    }
}
