mod peer_id;

pub use peer_id::PeerId;

/// Index of a fixed-size slice of the shared file. Blocks are equal sized
/// except possibly the last one.
pub type BlockId = u64;

/// Files have no hash identity; peers sharing the same name form a swarm.
pub type FileName = String;
