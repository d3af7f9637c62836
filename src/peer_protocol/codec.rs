use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{
    bytes::{BufMut, Bytes, BytesMut},
    codec::{length_delimited::LengthDelimitedCodec, Decoder, Encoder, Framed},
};

use super::error::WireError;
use crate::swarm::{BlockId, PeerId};

/// A message exchanged between two peers after the handshake (the handshake
/// itself travels as the first frame of the same codec).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Handshake { peer_id: PeerId },
    Have { blocks: Vec<BlockId> },
    RequestBlock { block_id: BlockId },
    BlockData { block_id: BlockId, bytes: Bytes },
    Choke,
    Unchoke,
    /// A type this implementation does not know. Kept so receivers can log
    /// and skip it instead of tearing the connection down.
    Unknown,
}

// the JSON header of a frame. block payloads are not embedded in the JSON:
// the header declares payload_len and exactly that many raw bytes follow the
// frame on the wire.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FrameHeader {
    Handshake {
        peer_id: PeerId,
    },
    Have {
        blocks: Vec<BlockId>,
    },
    RequestBlock {
        block_id: BlockId,
    },
    BlockData {
        block_id: BlockId,
        payload_len: usize,
    },
    Choke,
    Unchoke,
    #[serde(other)]
    Unknown,
}

#[derive(Debug)]
pub struct PeerMessageCodec {
    // codec only used on decode, to split off length delimited JSON headers.
    inner_codec: LengthDelimitedCodec,
    // set after a block_data header was decoded but its raw tail has not
    // fully arrived yet.
    pending_payload: Option<(BlockId, usize)>,
}

impl PeerMessageCodec {
    const MAX_FRAME_SIZE: usize = 2 * (1 << 20);
    const MAX_PAYLOAD_SIZE: usize = 16 * (1 << 20);

    pub fn new() -> Self {
        Self {
            inner_codec: LengthDelimitedCodec::builder()
                .max_frame_length(Self::MAX_FRAME_SIZE)
                .new_codec(),
            pending_payload: None,
        }
    }
}

impl Default for PeerMessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PeerMessageCodec {
    type Item = PeerMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some((block_id, payload_len)) = self.pending_payload {
                if src.len() < payload_len {
                    src.reserve(payload_len - src.len());
                    return Ok(None);
                }

                self.pending_payload = None;
                let bytes = src.split_to(payload_len).freeze();
                return Ok(Some(PeerMessage::BlockData { block_id, bytes }));
            }

            let frame = match self.inner_codec.decode(src)? {
                Some(frame) => frame,
                None => return Ok(None),
            };

            let header: FrameHeader =
                serde_json::from_slice(&frame).map_err(WireError::malformed)?;

            type FH = FrameHeader;
            let msg = match header {
                FH::Handshake { peer_id } => PeerMessage::Handshake { peer_id },
                FH::Have { blocks } => PeerMessage::Have { blocks },
                FH::RequestBlock { block_id } => PeerMessage::RequestBlock { block_id },
                FH::BlockData {
                    block_id,
                    payload_len,
                } => {
                    if payload_len > Self::MAX_PAYLOAD_SIZE {
                        return Err(WireError::Malformed(format!(
                            "declared block payload of {} bytes exceeds the {} byte limit",
                            payload_len,
                            Self::MAX_PAYLOAD_SIZE
                        )));
                    }

                    self.pending_payload = Some((block_id, payload_len));
                    continue;
                }
                FH::Choke => PeerMessage::Choke,
                FH::Unchoke => PeerMessage::Unchoke,
                FH::Unknown => PeerMessage::Unknown,
            };

            return Ok(Some(msg));
        }
    }
}

impl Encoder<PeerMessage> for PeerMessageCodec {
    type Error = WireError;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // the inner codec is not used on encode, the length prefix is written
        // directly into the dst buffer of the Framed instance.
        type PM = PeerMessage;
        let (header, payload) = match item {
            PM::Handshake { peer_id } => (FrameHeader::Handshake { peer_id }, None),
            PM::Have { blocks } => (FrameHeader::Have { blocks }, None),
            PM::RequestBlock { block_id } => (FrameHeader::RequestBlock { block_id }, None),
            PM::BlockData { block_id, bytes } => (
                FrameHeader::BlockData {
                    block_id,
                    payload_len: bytes.len(),
                },
                Some(bytes),
            ),
            PM::Choke => (FrameHeader::Choke, None),
            PM::Unchoke => (FrameHeader::Unchoke, None),
            PM::Unknown => {
                return Err(WireError::Malformed(
                    "refusing to encode an unknown message".to_string(),
                ))
            }
        };

        let body = serde_json::to_vec(&header).map_err(WireError::malformed)?;
        let payload_len = payload.as_ref().map_or(0, Bytes::len);

        dst.reserve(4 + body.len() + payload_len);
        dst.put_u32(body.len() as u32);
        dst.put(body.as_slice());
        if let Some(payload) = payload {
            dst.put(payload);
        }

        Ok(())
    }
}

pub type PeerFrames<T> = Framed<T, PeerMessageCodec>;

pub fn upgrade_stream<T>(stream: T) -> PeerFrames<T>
where
    T: AsyncRead + AsyncWrite,
{
    PeerFrames::new(stream, PeerMessageCodec::new())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use tokio_stream::StreamExt;

    fn encode_all(messages: Vec<PeerMessage>) -> BytesMut {
        let mut codec = PeerMessageCodec::new();
        let mut buffer = BytesMut::new();
        for msg in messages {
            codec
                .encode(msg, &mut buffer)
                .expect("encoding should not fail");
        }
        buffer
    }

    fn raw_frame(json: &str) -> BytesMut {
        let mut buffer = BytesMut::new();
        buffer.put_u32(json.len() as u32);
        buffer.put(json.as_bytes());
        buffer
    }

    #[test]
    fn test_header_wire_shape() {
        let buffer = encode_all(vec![PeerMessage::RequestBlock { block_id: 7 }]);

        let (len_prefix, body) = buffer.split_at(4);
        assert_eq!(len_prefix, (body.len() as u32).to_be_bytes());
        assert_eq!(body, br#"{"type":"request_block","block_id":7}"#);
    }

    #[test]
    fn test_block_data_raw_tail_follows_header() {
        let bytes = Bytes::from_static(b"block payload bytes");
        let buffer = encode_all(vec![PeerMessage::BlockData {
            block_id: 3,
            bytes: bytes.clone(),
        }]);

        // the frame ends with the raw payload, outside the JSON header
        assert!(buffer.ends_with(&bytes));

        let header_len = u32::from_be_bytes(buffer[..4].try_into().unwrap()) as usize;
        let header = &buffer[4..4 + header_len];
        assert_eq!(
            header,
            format!(
                r#"{{"type":"block_data","block_id":3,"payload_len":{}}}"#,
                bytes.len()
            )
            .as_bytes()
        );
    }

    #[test]
    fn test_decode_handles_split_payload_tail() {
        let bytes = Bytes::from_static(b"0123456789abcdef");
        let encoded = encode_all(vec![PeerMessage::BlockData {
            block_id: 11,
            bytes: bytes.clone(),
        }]);

        let mut codec = PeerMessageCodec::new();
        let mut incoming = BytesMut::new();

        // feed everything except the last 6 payload bytes; the decoder must
        // hold the parsed header and wait for the rest of the tail.
        let split_at = encoded.len() - 6;
        incoming.extend_from_slice(&encoded[..split_at]);
        assert!(codec
            .decode(&mut incoming)
            .expect("partial payload is not an error")
            .is_none());

        incoming.extend_from_slice(&encoded[split_at..]);
        let msg = codec
            .decode(&mut incoming)
            .expect("complete frame should decode")
            .expect("a full message is buffered");

        assert_eq!(msg, PeerMessage::BlockData { block_id: 11, bytes });
    }

    #[test]
    fn test_unknown_type_decodes_to_unknown() {
        let mut incoming = raw_frame(r#"{"type":"gossip","rumor":"spicy"}"#);

        let msg = PeerMessageCodec::new()
            .decode(&mut incoming)
            .expect("unknown types are not decode errors")
            .expect("a full frame is buffered");

        assert_eq!(msg, PeerMessage::Unknown);
    }

    #[test]
    fn test_malformed_json_is_a_malformed_error() {
        let mut incoming = raw_frame(r#"{"type": "have", "blocks": ["#);

        let err = PeerMessageCodec::new()
            .decode(&mut incoming)
            .expect_err("truncated JSON must fail to decode");

        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[test]
    fn test_oversized_payload_declaration_is_rejected() {
        let mut incoming =
            raw_frame(r#"{"type":"block_data","block_id":0,"payload_len":999999999999}"#);

        let err = PeerMessageCodec::new()
            .decode(&mut incoming)
            .expect_err("absurd payload_len must be rejected");

        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_decode_message_stream() {
        let peer_id = PeerId::new("MB-streamtest");
        let messages = vec![
            PeerMessage::Handshake { peer_id },
            PeerMessage::Have {
                blocks: vec![0, 2, 5],
            },
            PeerMessage::Unchoke,
            PeerMessage::RequestBlock { block_id: 2 },
            PeerMessage::BlockData {
                block_id: 2,
                bytes: Bytes::from_static(b"some block"),
            },
            PeerMessage::Choke,
        ];

        let buffer = encode_all(messages.clone());
        let mut decoder = upgrade_stream(Cursor::new(buffer.to_vec()));

        let mut decoded = Vec::new();
        while let Some(msg) = decoder.next().await {
            decoded.push(msg.expect("io error shouldn't occur when using cursor buffer"));
        }

        assert_eq!(decoded, messages);
    }
}
