/// 128-bit peer identity. The canonical textual form (36-character
/// hyphenated hex) is what crosses the wire during the handshake;
/// command payloads carry the 16 raw bytes.
pub type PeerId = uuid::Uuid;

/// Errors returned by trellis operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("handshake rejected")]
    Handshake,
    #[error("decode error")]
    Decode,
    #[error("connection closed")]
    Closed,
    #[error("peer not found")]
    PeerNotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
