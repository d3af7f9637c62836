use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::peer_protocol::PeerMessage;
use crate::swarm::PeerId;

/// Record of one established link, stored in the node's link map. The framed
/// socket itself is owned by the link's task; everyone else talks to the
/// remote through the outbound queue.
pub(super) struct PeerLink {
    peer_id: PeerId,
    addr: SocketAddr,
    outbound_tx: mpsc::Sender<PeerMessage>,
    /// the remote told us it will not serve our requests.
    choked_by_remote: AtomicBool,
    /// we granted upload to the remote in the current rotation.
    unchoked_by_us: AtomicBool,
}

impl PeerLink {
    const OUTBOUND_BUFFER: usize = 64;

    /// Build the record plus the receiving half its task will drain.
    pub fn channel(peer_id: PeerId, addr: SocketAddr) -> (Self, mpsc::Receiver<PeerMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(Self::OUTBOUND_BUFFER);

        let link = Self {
            peer_id,
            addr,
            outbound_tx,
            // a fresh link starts choked in both directions
            choked_by_remote: AtomicBool::new(true),
            unchoked_by_us: AtomicBool::new(false),
        };

        (link, outbound_rx)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A clone of the outbound queue handle, for sends outside the link map
    /// lock.
    pub fn sender(&self) -> mpsc::Sender<PeerMessage> {
        self.outbound_tx.clone()
    }

    pub fn is_choked_by_remote(&self) -> bool {
        self.choked_by_remote.load(Ordering::Acquire)
    }

    pub fn set_choked_by_remote(&self, choked: bool) {
        self.choked_by_remote.store(choked, Ordering::Release);
    }

    pub fn is_unchoked_by_us(&self) -> bool {
        self.unchoked_by_us.load(Ordering::Acquire)
    }

    pub fn set_unchoked_by_us(&self, unchoked: bool) {
        self.unchoked_by_us.store(unchoked, Ordering::Release);
    }
}
