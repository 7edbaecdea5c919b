use thiserror::Error;

/// Errors raised while decoding or encoding bencode.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is empty, has leading zeros, or does not fit in an i64.
    #[error("invalid integer")]
    InvalidInteger,

    /// Byte-string length prefix is not a valid number.
    #[error("invalid string length")]
    InvalidLength,

    /// A dictionary key is not a byte string.
    #[error("non-string dictionary key")]
    BadDictKey,

    /// Unexpected byte at the start of a value.
    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    /// Extra bytes follow the value.
    #[error("trailing data after value")]
    TrailingData,

    /// Recursion limit exceeded.
    #[error("nesting too deep")]
    NestingTooDeep,
}
