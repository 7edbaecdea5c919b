use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// Packet decoded as bencode but not as a KRPC message.
    #[error("malformed krpc message: {0}")]
    Malformed(&'static str),

    /// The transaction expired before a response arrived.
    #[error("query timed out")]
    Timeout,

    /// The remote answered with a KRPC error.
    #[error("krpc error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("server closed")]
    Closed,
}
