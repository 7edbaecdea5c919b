use thiserror::Error;

/// Errors that end a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Socket or storage I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrong protocol string or truncated handshake.
    #[error("bad handshake")]
    BadHandshake,

    /// The handshake named a different torrent than we dialed for.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Frame length exceeds the configured maximum.
    #[error("frame of {0} bytes exceeds limit")]
    BadFrame(usize),

    /// A frame's payload was shorter than its message type requires.
    #[error("truncated {0} message")]
    Truncated(&'static str),

    /// Unknown message type byte.
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    /// The peer broke a protocol rule.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A Piece arrived with no matching outstanding request.
    #[error("unexpected piece")]
    UnexpectedPiece,

    /// The remote closed the connection.
    #[error("connection closed")]
    Closed,
}
