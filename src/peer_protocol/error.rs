use thiserror::Error;

/// Failure modes of a framed peer or tracker channel.
#[derive(Debug, Error)]
pub enum WireError {
    /// The remote closed the socket or the OS reported a transport error.
    #[error("peer disconnected")]
    Disconnected,

    /// A frame arrived but its body could not be understood.
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The first frame on a fresh connection was not a handshake.
    #[error("expected handshake, got {0}")]
    HandshakeMismatch(String),
}

impl WireError {
    pub fn malformed(err: impl std::fmt::Display) -> Self {
        Self::Malformed(err.to_string())
    }
}
