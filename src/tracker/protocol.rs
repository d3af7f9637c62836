use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{
    bytes::{BufMut, BytesMut},
    codec::{length_delimited::LengthDelimitedCodec, Decoder, Encoder, Framed},
};

use crate::peer_protocol::WireError;
use crate::swarm::{BlockId, FileName, PeerId};

/// A peer's listening endpoint as it travels on the wire: `[host, port]`.
pub type PeerAddress = (String, u16);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum TrackerCommand {
    #[serde(rename = "REGISTER")]
    Register {
        peer_id: PeerId,
        file_name: FileName,
        address: PeerAddress,
        blocks: Vec<BlockId>,
    },
    #[serde(rename = "GET_PEERS")]
    GetPeers { peer_id: PeerId, file_name: FileName },
    #[serde(rename = "UPDATE_BLOCKS")]
    UpdateBlocks {
        peer_id: PeerId,
        file_name: FileName,
        blocks: Vec<BlockId>,
    },
    /// any command name this tracker does not understand.
    #[serde(other)]
    Unknown,
}

impl TrackerCommand {
    /// The id the sender identified itself with, used to scrub state when a
    /// session ends badly.
    pub fn peer_id(&self) -> Option<&PeerId> {
        type TC = TrackerCommand;
        match self {
            TC::Register { peer_id, .. }
            | TC::GetPeers { peer_id, .. }
            | TC::UpdateBlocks { peer_id, .. } => Some(peer_id),
            TC::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub address: PeerAddress,
    pub blocks: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TrackerResponse {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peers: Option<Vec<PeerEntry>>,
    },
    Error { reason: String },
}

impl TrackerResponse {
    pub fn ok() -> Self {
        Self::Ok { peers: None }
    }

    pub fn with_peers(peers: Vec<PeerEntry>) -> Self {
        Self::Ok { peers: Some(peers) }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }

    /// Collapse the error variant so client code can use `?` on a rejection.
    pub fn into_result(self) -> anyhow::Result<Option<Vec<PeerEntry>>> {
        match self {
            Self::Ok { peers } => Ok(peers),
            Self::Error { reason } => anyhow::bail!("{} (tracker)", reason),
        }
    }
}

/// Length prefixed JSON codec shared by both ends of the tracker protocol.
/// `Out` frames are encoded and `In` frames decoded; the server and the
/// client instantiate it with the directions swapped.
#[derive(Debug)]
pub struct JsonCodec<In, Out> {
    inner_codec: LengthDelimitedCodec,
    _direction: PhantomData<fn(Out) -> In>,
}

impl<In, Out> JsonCodec<In, Out> {
    const MAX_FRAME_SIZE: usize = 2 * (1 << 20);

    pub fn new() -> Self {
        Self {
            inner_codec: LengthDelimitedCodec::builder()
                .max_frame_length(Self::MAX_FRAME_SIZE)
                .new_codec(),
            _direction: PhantomData,
        }
    }
}

impl<In, Out> Default for JsonCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for JsonCodec<In, Out> {
    type Item = In;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = match self.inner_codec.decode(src)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(WireError::malformed)
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonCodec<In, Out> {
    type Error = WireError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item).map_err(WireError::malformed)?;

        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.put(body.as_slice());
        Ok(())
    }
}

pub type ServerFrames<T> = Framed<T, JsonCodec<TrackerCommand, TrackerResponse>>;
pub type ClientFrames<T> = Framed<T, JsonCodec<TrackerResponse, TrackerCommand>>;

pub fn server_frames<T>(stream: T) -> ServerFrames<T>
where
    T: AsyncRead + AsyncWrite,
{
    ServerFrames::new(stream, JsonCodec::new())
}

pub fn client_frames<T>(stream: T) -> ClientFrames<T>
where
    T: AsyncRead + AsyncWrite,
{
    ClientFrames::new(stream, JsonCodec::new())
}
