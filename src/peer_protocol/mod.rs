pub mod codec;
pub mod error;
pub mod handshake;

pub use codec::{upgrade_stream, PeerFrames, PeerMessage};
pub use error::WireError;
