//! Peer wire protocol (BEP-3, BEP-6).
//!
//! The wire codec, the per-connection protocol state machine, and the
//! outbound message queue. The [`crate::client`] actor drives receive
//! transitions; the reader and writer loops own only their socket halves.

mod bitfield;
mod conn;
mod error;
mod id;
mod outbox;
mod wire;

pub use bitfield::Bitfield;
pub use conn::{Conn, ConnId};
pub use error::PeerError;
pub use id::PeerId;
pub use outbox::{write_loop, Outbox};
pub use wire::{
    connect_handshake, read_handshake_peer_id, read_handshake_prefix, send_handshake, Handshake,
    Message, MessageId, HANDSHAKE_LEN, PROTOCOL,
};

#[cfg(test)]
mod tests;
