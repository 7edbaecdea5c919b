//! Bencode encoding and decoding (BEP-3).
//!
//! Only the value model needed by KRPC is provided: integers, byte strings,
//! lists, and dictionaries with byte-string keys. Byte strings are
//! [`bytes::Bytes`] so decoded packets share the receive buffer.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;
