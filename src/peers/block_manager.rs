use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio_util::bytes::Bytes;

use crate::prelude::*;
use crate::swarm::{BlockId, FileName, PeerId};

/// Owns the bytes of every block this peer holds plus the last known
/// inventory of every remote, from which rarest-first selection is computed.
/// The peer node wraps it in a mutex; nothing in here suspends.
pub struct BlockManager {
    file_name: FileName,
    block_size: usize,
    block_count: u64,
    my_blocks: BTreeMap<BlockId, Bytes>,
    peer_block_map: HashMap<PeerId, HashSet<BlockId>>,
    download_dir: PathBuf,
}

impl BlockManager {
    pub fn new(file_name: impl Into<FileName>, block_size: usize, download_dir: PathBuf) -> Self {
        Self {
            file_name: file_name.into(),
            block_size,
            block_count: 0,
            my_blocks: BTreeMap::new(),
            peer_block_map: HashMap::new(),
            download_dir,
        }
    }

    /// Split a local file into blocks and take all of them (seeder
    /// bootstrap). The last block may be shorter than `block_size`.
    pub fn load_from_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let contents = fs::read(path)
            .with_context(|| format!("failed to read seed file at {}", path.display()))?;

        self.block_count = (contents.len() as u64).div_ceil(self.block_size as u64);
        for (id, chunk) in contents.chunks(self.block_size).enumerate() {
            self.my_blocks
                .insert(id as BlockId, Bytes::copy_from_slice(chunk));
        }

        info!(
            "loaded '{}' as {} blocks of up to {} bytes",
            path.display(),
            self.block_count,
            self.block_size
        );
        Ok(())
    }

    /// Store a downloaded block. Duplicates and ids outside the known range
    /// are ignored; returns whether the block was newly stored.
    pub fn add_block(&mut self, id: BlockId, bytes: Bytes) -> bool {
        if id >= self.block_count || bytes.is_empty() {
            warn!(
                "dropping block {id} ({} bytes), outside the known range of {}",
                bytes.len(),
                self.block_count
            );
            return false;
        }
        if self.have_block(id) {
            return false;
        }

        self.my_blocks.insert(id, bytes);
        debug!("stored block {id}");
        true
    }

    pub fn have_block(&self, id: BlockId) -> bool {
        self.my_blocks.contains_key(&id)
    }

    pub fn get_block(&self, id: BlockId) -> Option<Bytes> {
        self.my_blocks.get(&id).cloned()
    }

    pub fn my_block_ids(&self) -> Vec<BlockId> {
        self.my_blocks.keys().copied().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.block_count > 0 && self.my_blocks.len() as u64 == self.block_count
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// (blocks held, blocks total); total is 0 until the swarm taught us the
    /// file's size.
    pub fn progress(&self) -> (u64, u64) {
        (self.my_blocks.len() as u64, self.block_count)
    }

    /// Overwrite the recorded inventory of a remote peer. Leechers also learn
    /// the file's block count here: the highest id ever advertised bounds it
    /// from below, and the count never shrinks.
    pub fn update_peer_blocks(&mut self, peer_id: PeerId, blocks: HashSet<BlockId>) {
        if let Some(highest) = blocks.iter().max() {
            self.block_count = self.block_count.max(highest + 1);
        }
        self.peer_block_map.insert(peer_id, blocks);
    }

    pub fn get_peer_blocks(&self, peer_id: &PeerId) -> HashSet<BlockId> {
        self.peer_block_map.get(peer_id).cloned().unwrap_or_default()
    }

    /// Drop everything known about a departed peer.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peer_block_map.remove(peer_id);
    }

    pub fn peers_with_block(&self, id: BlockId) -> Vec<PeerId> {
        self.peer_block_map
            .iter()
            .filter(|(_, blocks)| blocks.contains(&id))
            .map(|(peer_id, _)| peer_id.clone())
            .collect()
    }

    /// True when the remote lacks at least one block we hold, i.e. it has a
    /// reason to be interested in us.
    pub fn wants_from_us(&self, peer_id: &PeerId) -> bool {
        let theirs = self.peer_block_map.get(peer_id);
        self.my_blocks
            .keys()
            .any(|id| theirs.map_or(true, |blocks| !blocks.contains(id)))
    }

    /// Missing blocks ordered rarest first: ascending by the number of known
    /// holders, ties broken by id. Recomputed from scratch on every call
    /// since rarity shifts with each `have` announcement. Blocks no known
    /// peer holds sort first and stay unrequestable until a holder shows up.
    pub fn get_rarest_missing_blocks(&self) -> Vec<BlockId> {
        let mut holder_counts: HashMap<BlockId, usize> = HashMap::new();
        for blocks in self.peer_block_map.values() {
            for id in blocks {
                *holder_counts.entry(*id).or_default() += 1;
            }
        }

        let mut missing: Vec<(usize, BlockId)> = (0..self.block_count)
            .filter(|id| !self.my_blocks.contains_key(id))
            .map(|id| (holder_counts.get(&id).copied().unwrap_or(0), id))
            .collect();
        missing.sort_unstable();

        missing.into_iter().map(|(_, id)| id).collect()
    }

    /// Write the reassembled file to `<download_dir>/<file_name>`. Only valid
    /// once every block is held.
    pub fn reconstruct_file(&self) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(
            self.is_complete(),
            "refusing to reconstruct '{}' from an incomplete block set",
            self.file_name
        );

        fs::create_dir_all(&self.download_dir).with_context(|| {
            format!("failed to create download dir {}", self.download_dir.display())
        })?;

        let mut contents = Vec::new();
        for bytes in self.my_blocks.values() {
            contents.extend_from_slice(bytes);
        }

        let out_path = self.download_dir.join(&self.file_name);
        fs::write(&out_path, contents)
            .with_context(|| format!("failed to write {}", out_path.display()))?;

        info!("reconstructed '{}' at {}", self.file_name, out_path.display());
        Ok(out_path)
    }
}
