use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::block_manager::BlockManager;
use super::link::PeerLink;
use super::unchoke_manager::UnchokeManager;
use super::{NodeConfig, PeerStream};
use crate::peer_protocol::{handshake, upgrade_stream, PeerFrames, PeerMessage};
use crate::prelude::*;
use crate::swarm::{BlockId, FileName, PeerId};
use crate::tracker::protocol::PeerAddress;
use crate::tracker::TrackerClient;

/// A participant in a swarm: one listening endpoint, one task per
/// established link, and the two periodic control loops (block requests and
/// unchoke rotation).
pub struct PeerNode {
    shared: Arc<NodeShared>,
}

struct NodeShared {
    peer_id: PeerId,
    file_name: FileName,
    listen_port: u16,
    config: NodeConfig,
    blocks: Mutex<BlockManager>,
    chokes: Mutex<UnchokeManager>,
    links: Mutex<HashMap<PeerId, PeerLink>>,
    known_peers: Mutex<HashMap<PeerId, PeerAddress>>,
    tracker: TrackerClient,
    shutdown: CancellationToken,
}

impl PeerNode {
    /// Start as a seeder: split the local file into blocks, register the
    /// full inventory and serve it.
    pub async fn share_file(
        tracker_addr: (String, u16),
        config: NodeConfig,
        file_path: &Path,
        block_size: usize,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(block_size > 0, "block size must be positive");

        let file_name = file_path
            .file_name()
            .and_then(OsStr::to_str)
            .context("seed file path has no usable file name")?
            .to_string();

        let mut blocks = BlockManager::new(file_name, block_size, config.download_dir.clone());
        blocks.load_from_file(file_path)?;

        Self::start(tracker_addr, config, blocks).await
    }

    /// Start as a leecher: register with an empty inventory and pull the
    /// named file from the swarm.
    pub async fn download_file(
        tracker_addr: (String, u16),
        config: NodeConfig,
        file_name: &str,
        block_size: usize,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(block_size > 0, "block size must be positive");

        let blocks = BlockManager::new(file_name, block_size, config.download_dir.clone());
        Self::start(tracker_addr, config, blocks).await
    }

    async fn start(
        tracker_addr: (String, u16),
        config: NodeConfig,
        blocks: BlockManager,
    ) -> anyhow::Result<Self> {
        // a port we cannot bind is the one fatal startup error
        let listener = TcpListener::bind(("127.0.0.1", config.listen_port))
            .await
            .context("failed to bind the peer listener")?;
        let listen_port = listener.local_addr()?.port();

        let peer_id = PeerId::with_random_suffix();
        let file_name = blocks.file_name().to_string();
        info!("peer {peer_id} listening on port {listen_port} for '{file_name}'");

        let tracker = TrackerClient::new(tracker_addr, peer_id.clone(), config.connect_timeout);
        let inventory = blocks.my_block_ids();

        let shared = Arc::new(NodeShared {
            peer_id,
            file_name: file_name.clone(),
            listen_port,
            config,
            blocks: Mutex::new(blocks),
            chokes: Mutex::new(UnchokeManager::new()),
            links: Mutex::new(HashMap::new()),
            known_peers: Mutex::new(HashMap::new()),
            tracker,
            shutdown: CancellationToken::new(),
        });

        // an unreachable tracker at startup is fatal too; later failures are
        // retried cycle by cycle
        shared
            .tracker
            .register(
                &file_name,
                ("127.0.0.1".to_string(), listen_port),
                inventory,
            )
            .await?;

        if let Err(err) = refresh_known_peers(&shared).await {
            warn!("initial peer list refresh failed: {err:#}");
        }

        tokio::spawn(accept_loop(Arc::clone(&shared), listener));
        tokio::spawn(request_loop(Arc::clone(&shared)));
        tokio::spawn(unchoke_loop(Arc::clone(&shared)));

        Ok(Self { shared })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.shared.peer_id
    }

    pub fn listen_port(&self) -> u16 {
        self.shared.listen_port
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.shared.blocks).is_complete()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        lock(&self.shared.links).keys().cloned().collect()
    }

    /// Cooperative shutdown: every loop exits at its next suspension point
    /// and link tasks drop their sockets on the way out.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn accept_loop(shared: Arc<NodeShared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_inbound(Arc::clone(&shared), stream, addr));
                }
                Err(err) => warn!("failed to accept inbound link: {err}"),
            }
        }
    }
    debug!("accept loop stopped");
}

#[instrument(name = "inbound link", level = "info", fields(%addr), skip_all)]
async fn handle_inbound(shared: Arc<NodeShared>, stream: TcpStream, addr: SocketAddr) {
    let mut frames = upgrade_stream(stream);

    let remote_id =
        match handshake::respond(&mut frames, &shared.peer_id, shared.config.handshake_timeout)
            .await
        {
            Ok(remote_id) => remote_id,
            Err(err) => {
                warn!("inbound handshake failed: {err}");
                return;
            }
        };

    run_link(shared, frames, remote_id, addr).await;
}

#[instrument(name = "outbound link", level = "info", fields(peer = %remote_id), skip_all)]
async fn dial_peer(shared: Arc<NodeShared>, remote_id: PeerId, address: PeerAddress) {
    let (host, port) = &address;

    // a peer we cannot reach is dropped silently and retried next cycle
    let stream = match timeout(
        shared.config.connect_timeout,
        TcpStream::connect((host.as_str(), *port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!("failed to reach {host}:{port}: {err}");
            return;
        }
        Err(_) => {
            debug!("connect to {host}:{port} timed out");
            return;
        }
    };

    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };

    let mut frames = upgrade_stream(stream);
    let handshake_id =
        match handshake::initiate(&mut frames, &shared.peer_id, shared.config.handshake_timeout)
            .await
        {
            Ok(handshake_id) => handshake_id,
            Err(err) => {
                warn!("handshake failed: {err}");
                return;
            }
        };

    if handshake_id != remote_id {
        // the tracker's word is stale, the handshake's is first hand
        warn!("peer at {host}:{port} identified as {handshake_id}, not {remote_id}");
    }

    run_link(shared, frames, handshake_id, addr).await;
}

/// Register the link, announce our inventory and pump messages until the
/// remote goes away or shutdown is requested.
async fn run_link<S: PeerStream>(
    shared: Arc<NodeShared>,
    mut frames: PeerFrames<S>,
    remote_id: PeerId,
    addr: SocketAddr,
) {
    if remote_id == shared.peer_id {
        debug!("refusing a link to ourselves");
        return;
    }

    let inventory = lock(&shared.blocks).my_block_ids();
    if let Err(err) = frames.send(PeerMessage::Have { blocks: inventory }).await {
        warn!("failed to announce inventory to {remote_id}: {err}");
        return;
    }

    let (link, outbound_rx) = PeerLink::channel(remote_id.clone(), addr);
    {
        let mut links = lock(&shared.links);
        if links.contains_key(&remote_id) {
            debug!("already linked with {remote_id}, dropping the duplicate");
            return;
        }
        info!("link established with {} at {}", link.peer_id(), link.addr());
        links.insert(remote_id.clone(), link);
    }

    if let Err(err) = message_loop(&shared, &mut frames, outbound_rx, &remote_id).await {
        warn!("link with {remote_id} failed: {err:#}");
    }

    detach_link(&shared, &remote_id);
}

async fn message_loop<S: PeerStream>(
    shared: &Arc<NodeShared>,
    frames: &mut PeerFrames<S>,
    mut outbound_rx: mpsc::Receiver<PeerMessage>,
    remote_id: &PeerId,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return Ok(()),

            Some(message) = outbound_rx.recv() => {
                frames.send(message).await?;
            }

            frame = frames.next() => match frame {
                None => {
                    info!("{remote_id} closed the link");
                    return Ok(());
                }
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(message)) => dispatch_message(shared, frames, remote_id, message).await?,
            }
        }
    }
}

async fn dispatch_message<S: PeerStream>(
    shared: &Arc<NodeShared>,
    frames: &mut PeerFrames<S>,
    remote_id: &PeerId,
    message: PeerMessage,
) -> anyhow::Result<()> {
    type PM = PeerMessage;
    match message {
        PM::Have { blocks } => {
            trace!("{remote_id} advertises {} blocks", blocks.len());
            lock(&shared.blocks)
                .update_peer_blocks(remote_id.clone(), blocks.into_iter().collect());
        }

        PM::RequestBlock { block_id } => {
            // serve only unchoked peers and only blocks we hold; anything
            // else is dropped without a reply and the remote retries later
            let granted = lock(&shared.chokes).is_unchoked(remote_id);
            let bytes = if granted {
                lock(&shared.blocks).get_block(block_id)
            } else {
                None
            };

            match bytes {
                Some(bytes) => {
                    debug!("serving block {block_id} to {remote_id}");
                    frames.send(PM::BlockData { block_id, bytes }).await?;
                }
                None => trace!(
                    "dropping request for block {block_id} from {remote_id} (choked or absent)"
                ),
            }
        }

        PM::BlockData { block_id, bytes } => {
            handle_block_received(shared, remote_id, block_id, bytes).await;
        }

        PM::Choke => {
            debug!("{remote_id} choked us");
            if let Some(link) = lock(&shared.links).get(remote_id) {
                link.set_choked_by_remote(true);
            }
        }

        PM::Unchoke => {
            debug!("{remote_id} unchoked us");
            if let Some(link) = lock(&shared.links).get(remote_id) {
                link.set_choked_by_remote(false);
            }
        }

        PM::Handshake { .. } => warn!("ignoring repeated handshake from {remote_id}"),
        PM::Unknown => warn!("ignoring message of unknown type from {remote_id}"),
    }
    Ok(())
}

async fn handle_block_received(
    shared: &Arc<NodeShared>,
    remote_id: &PeerId,
    block_id: BlockId,
    bytes: Bytes,
) {
    let (added, inventory, completed) = {
        let mut blocks = lock(&shared.blocks);
        let added = blocks.add_block(block_id, bytes);
        (added, blocks.my_block_ids(), added && blocks.is_complete())
    };

    if !added {
        trace!("ignoring redundant block {block_id} from {remote_id}");
        return;
    }

    // the have goes out only after the block is stored, so a remote seeing
    // it may immediately request the block from us
    broadcast(shared, PeerMessage::Have {
        blocks: inventory.clone(),
    });

    if let Err(err) = shared
        .tracker
        .update_blocks(&shared.file_name, inventory)
        .await
    {
        warn!("failed to refresh tracker inventory: {err:#}");
    }

    if completed {
        let written = lock(&shared.blocks).reconstruct_file();
        match written {
            Ok(path) => info!("download complete, wrote {}", path.display()),
            Err(err) => error!("failed to write completed download: {err:#}"),
        }
    }
}

/// Queue a frame to every established link: snapshot the senders under the
/// lock, hand the frames over outside it.
fn broadcast(shared: &Arc<NodeShared>, message: PeerMessage) {
    let targets: Vec<(PeerId, mpsc::Sender<PeerMessage>)> = lock(&shared.links)
        .values()
        .map(|link| (link.peer_id().clone(), link.sender()))
        .collect();

    for (peer_id, sender) in targets {
        if sender.try_send(message.clone()).is_err() {
            warn!("outbound queue to {peer_id} is stalled, skipping broadcast frame");
        }
    }
}

fn detach_link(shared: &Arc<NodeShared>, remote_id: &PeerId) {
    lock(&shared.links).remove(remote_id);
    lock(&shared.blocks).remove_peer(remote_id);
    lock(&shared.chokes).forget_peer(remote_id);
    lock(&shared.known_peers).remove(remote_id);
    info!("link with {remote_id} cleaned up");
}

async fn request_loop(shared: Arc<NodeShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(shared.config.request_interval) => {}
        }

        if let Err(err) = refresh_known_peers(&shared).await {
            warn!("tracker refresh failed: {err:#}, retrying next cycle");
        }

        dial_unconnected_peers(&shared);
        send_block_requests(&shared);

        let (held, total) = lock(&shared.blocks).progress();
        if total > 0 && held < total {
            info!("download progress: {held}/{total} blocks");
        }
    }
    debug!("request loop stopped");
}

async fn refresh_known_peers(shared: &Arc<NodeShared>) -> anyhow::Result<()> {
    let peers = shared.tracker.get_peers(&shared.file_name).await?;
    debug!("tracker returned {} peers", peers.len());

    for entry in peers {
        if entry.peer_id == shared.peer_id {
            continue;
        }
        lock(&shared.blocks)
            .update_peer_blocks(entry.peer_id.clone(), entry.blocks.iter().copied().collect());
        lock(&shared.known_peers).insert(entry.peer_id, entry.address);
    }
    Ok(())
}

fn dial_unconnected_peers(shared: &Arc<NodeShared>) {
    let known: Vec<(PeerId, PeerAddress)> = lock(&shared.known_peers)
        .iter()
        .map(|(peer_id, address)| (peer_id.clone(), address.clone()))
        .collect();
    let connected: HashSet<PeerId> = lock(&shared.links).keys().cloned().collect();

    for (peer_id, address) in known {
        if connected.contains(&peer_id) {
            continue;
        }
        tokio::spawn(dial_peer(Arc::clone(shared), peer_id, address));
    }
}

/// One rarest-first pass: walk the missing blocks in selection order and ask
/// at most one block of each reachable holder per cycle.
fn send_block_requests(shared: &Arc<NodeShared>) {
    // candidate holders per missing block (lock order: blocks, then links)
    let wanted: Vec<(BlockId, Vec<PeerId>)> = {
        let blocks = lock(&shared.blocks);
        if blocks.is_complete() {
            return;
        }
        blocks
            .get_rarest_missing_blocks()
            .into_iter()
            .map(|block_id| (block_id, blocks.peers_with_block(block_id)))
            .collect()
    };

    let mut outgoing: Vec<(PeerId, mpsc::Sender<PeerMessage>, BlockId)> = Vec::new();
    {
        let links = lock(&shared.links);
        let mut asked: HashSet<PeerId> = HashSet::new();

        for (block_id, holders) in wanted {
            let candidate = holders.into_iter().find(|peer_id| {
                !asked.contains(peer_id)
                    && links
                        .get(peer_id)
                        .map_or(false, |link| !link.is_choked_by_remote())
            });

            if let Some(peer_id) = candidate {
                let Some(link) = links.get(&peer_id) else {
                    continue;
                };
                asked.insert(peer_id.clone());
                outgoing.push((peer_id, link.sender(), block_id));
            }
        }
    }

    for (peer_id, sender, block_id) in outgoing {
        debug!("requesting block {block_id} from {peer_id}");
        if sender
            .try_send(PeerMessage::RequestBlock { block_id })
            .is_err()
        {
            debug!("outbound queue to {peer_id} is stalled, skipping request");
        }
    }
}

async fn unchoke_loop(shared: Arc<NodeShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(shared.config.unchoke_interval) => {}
        }

        // interest snapshot under the block manager lock, then the link map
        // lock, always in that order
        let interested: Vec<PeerId> = {
            let blocks = lock(&shared.blocks);
            let links = lock(&shared.links);
            links
                .keys()
                .filter(|peer_id| blocks.wants_from_us(peer_id))
                .cloned()
                .collect()
        };

        let (to_choke, to_unchoke) = lock(&shared.chokes).evaluate_peers(interested);

        let mut outgoing: Vec<(PeerId, mpsc::Sender<PeerMessage>, PeerMessage)> = Vec::new();
        {
            let links = lock(&shared.links);
            for peer_id in to_unchoke {
                if let Some(link) = links.get(&peer_id) {
                    if !link.is_unchoked_by_us() {
                        link.set_unchoked_by_us(true);
                        outgoing.push((peer_id, link.sender(), PeerMessage::Unchoke));
                    }
                }
            }
            for peer_id in to_choke {
                if let Some(link) = links.get(&peer_id) {
                    if link.is_unchoked_by_us() {
                        link.set_unchoked_by_us(false);
                        outgoing.push((peer_id, link.sender(), PeerMessage::Choke));
                    }
                }
            }
        }

        for (peer_id, sender, message) in outgoing {
            debug!("sending {message:?} to {peer_id}");
            if sender.try_send(message).is_err() {
                warn!("outbound queue to {peer_id} is stalled, dropping choke update");
            }
        }
    }
    debug!("unchoke loop stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracker::Tracker;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn fast_config(download_dir: PathBuf) -> NodeConfig {
        NodeConfig {
            listen_port: 0,
            request_interval: Duration::from_millis(100),
            unchoke_interval: Duration::from_millis(150),
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_millis(300),
            download_dir,
        }
    }

    async fn spawn_tracker() -> ((String, u16), CancellationToken) {
        let shutdown = CancellationToken::new();
        let tracker = Tracker::bind(("127.0.0.1", 0), shutdown.clone())
            .await
            .expect("binding an ephemeral port should succeed");
        let addr = tracker.local_addr().expect("listener has a local addr");
        tokio::spawn(tracker.run());
        ((addr.ip().to_string(), addr.port()), shutdown)
    }

    async fn wait_for_download(out_path: &Path, original: &[u8], deadline: Duration) {
        timeout(deadline, async {
            loop {
                if fs::read(out_path).map_or(false, |contents| contents == original) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} was not downloaded in time", out_path.display()));
    }

    #[tokio::test]
    async fn test_leecher_downloads_a_three_block_file_byte_identically() {
        let (tracker_addr, _tracker_shutdown) = spawn_tracker().await;
        let workspace = TempDir::new().expect("temp dir should be creatable");

        let source = workspace.path().join("payload.bin");
        let original = b"three blocks of data".to_vec(); // 20 bytes: 8 + 8 + 4
        fs::write(&source, &original).expect("write seed file");

        let seeder = PeerNode::share_file(
            tracker_addr.clone(),
            fast_config(workspace.path().join("seeder")),
            &source,
            8,
        )
        .await
        .expect("seeder should start");
        assert!(seeder.is_complete());

        let leecher = PeerNode::download_file(
            tracker_addr,
            fast_config(workspace.path().join("leecher")),
            "payload.bin",
            8,
        )
        .await
        .expect("leecher should start");
        assert!(!leecher.is_complete());

        let out_path = workspace.path().join("leecher").join("payload.bin");
        wait_for_download(&out_path, &original, Duration::from_secs(15)).await;
        assert!(leecher.is_complete());

        seeder.shutdown();
        leecher.shutdown();
    }

    #[tokio::test]
    async fn test_two_leechers_both_complete() {
        let (tracker_addr, _tracker_shutdown) = spawn_tracker().await;
        let workspace = TempDir::new().expect("temp dir should be creatable");

        let source = workspace.path().join("payload.bin");
        let original: Vec<u8> = (0u8..32).collect(); // 4 blocks of 8
        fs::write(&source, &original).expect("write seed file");

        let seeder = PeerNode::share_file(
            tracker_addr.clone(),
            fast_config(workspace.path().join("seeder")),
            &source,
            8,
        )
        .await
        .expect("seeder should start");

        let first = PeerNode::download_file(
            tracker_addr.clone(),
            fast_config(workspace.path().join("first")),
            "payload.bin",
            8,
        )
        .await
        .expect("first leecher should start");
        let second = PeerNode::download_file(
            tracker_addr,
            fast_config(workspace.path().join("second")),
            "payload.bin",
            8,
        )
        .await
        .expect("second leecher should start");

        let first_out = workspace.path().join("first").join("payload.bin");
        let second_out = workspace.path().join("second").join("payload.bin");
        wait_for_download(&first_out, &original, Duration::from_secs(20)).await;
        wait_for_download(&second_out, &original, Duration::from_secs(20)).await;

        seeder.shutdown();
        first.shutdown();
        second.shutdown();
    }

    #[tokio::test]
    async fn test_handshakeless_connection_is_closed_and_leaves_no_link() {
        let (tracker_addr, _tracker_shutdown) = spawn_tracker().await;
        let workspace = TempDir::new().expect("temp dir should be creatable");

        let source = workspace.path().join("payload.bin");
        fs::write(&source, b"some data").expect("write seed file");

        let seeder = PeerNode::share_file(
            tracker_addr,
            fast_config(workspace.path().join("seeder")),
            &source,
            4,
        )
        .await
        .expect("seeder should start");

        let mut socket = TcpStream::connect(("127.0.0.1", seeder.listen_port()))
            .await
            .expect("the seeder is listening");

        // send nothing: the acceptor must give up after its handshake
        // deadline and close the socket
        let mut buffer = [0u8; 16];
        let read = timeout(Duration::from_secs(2), socket.read(&mut buffer))
            .await
            .expect("acceptor should have closed the socket")
            .expect("expecting a clean close, not a reset");
        assert_eq!(read, 0);

        assert!(seeder.connected_peers().is_empty());
        seeder.shutdown();
    }
}
