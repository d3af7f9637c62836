use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_stream::StreamExt;

use super::codec::{PeerFrames, PeerMessage};
use super::error::WireError;
use crate::swarm::PeerId;

/// Send our handshake, then wait for the remote's. Run by the dialing side.
/// Either side closes the link on mismatch or timeout, so the whole exchange
/// is bounded by `deadline`.
pub async fn initiate<S>(
    frames: &mut PeerFrames<S>,
    own_id: &PeerId,
    deadline: Duration,
) -> Result<PeerId, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    frames
        .send(PeerMessage::Handshake {
            peer_id: own_id.clone(),
        })
        .await?;

    timeout(deadline, read_handshake(frames))
        .await
        .map_err(|_| WireError::HandshakeTimeout)?
}

/// Wait for the remote's handshake, then reply with ours. Run by the
/// accepting side.
pub async fn respond<S>(
    frames: &mut PeerFrames<S>,
    own_id: &PeerId,
    deadline: Duration,
) -> Result<PeerId, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote_id = timeout(deadline, read_handshake(frames))
        .await
        .map_err(|_| WireError::HandshakeTimeout)??;

    frames
        .send(PeerMessage::Handshake {
            peer_id: own_id.clone(),
        })
        .await?;

    Ok(remote_id)
}

async fn read_handshake<S>(frames: &mut PeerFrames<S>) -> Result<PeerId, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match frames.next().await {
        None => Err(WireError::Disconnected),
        Some(Err(err)) => Err(err),
        Some(Ok(PeerMessage::Handshake { peer_id })) => Ok(peer_id),
        Some(Ok(other)) => Err(WireError::HandshakeMismatch(format!("{:?}", other))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer_protocol::codec::upgrade_stream;

    const TEST_DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_handshake_exchanges_ids() {
        let (dialer, acceptor) = tokio::io::duplex(1024);
        let mut dialer_frames = upgrade_stream(dialer);
        let mut acceptor_frames = upgrade_stream(acceptor);

        let dialer_id = PeerId::new("MB-dialer0000");
        let acceptor_id = PeerId::new("MB-acceptor00");

        let (dialed, accepted) = tokio::join!(
            initiate(&mut dialer_frames, &dialer_id, TEST_DEADLINE),
            respond(&mut acceptor_frames, &acceptor_id, TEST_DEADLINE),
        );

        assert_eq!(
            dialed.expect("dialer handshake should succeed"),
            acceptor_id
        );
        assert_eq!(
            accepted.expect("acceptor handshake should succeed"),
            dialer_id
        );
    }

    #[tokio::test]
    async fn test_non_handshake_first_frame_is_rejected() {
        use tokio_util::bytes::BytesMut;
        use tokio_util::codec::Encoder;

        let mut first_frame = BytesMut::new();
        crate::peer_protocol::codec::PeerMessageCodec::new()
            .encode(PeerMessage::Have { blocks: vec![0] }, &mut first_frame)
            .expect("encoding should not fail");

        let mock_stream = tokio_test::io::Builder::new().read(&first_frame).build();
        let mut frames = upgrade_stream(mock_stream);

        let err = respond(&mut frames, &PeerId::new("MB-acceptor00"), TEST_DEADLINE)
            .await
            .expect_err("first frame was not a handshake");

        assert!(matches!(err, WireError::HandshakeMismatch(_)));
    }

    #[tokio::test]
    async fn test_silent_dialer_times_out() {
        let (_dialer, acceptor) = tokio::io::duplex(1024);
        let mut acceptor_frames = upgrade_stream(acceptor);

        let err = respond(
            &mut acceptor_frames,
            &PeerId::new("MB-acceptor00"),
            Duration::from_millis(50),
        )
        .await
        .expect_err("nothing was sent, the wait must expire");

        assert!(matches!(err, WireError::HandshakeTimeout));
    }
}
