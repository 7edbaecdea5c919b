//! Distributed Hash Table (BEP-5).
//!
//! A self-contained KRPC-over-UDP service used to find peers for an
//! infohash without trackers. The routing table is a flat map from address
//! to node; closest-k selection orders candidates by the full 160-bit XOR
//! distance. Outgoing queries are matched to responses by a varint
//! transaction id scoped to the remote address, with a one-minute timeout
//! that closes the caller's response channel.

mod error;
mod message;
mod node;
mod server;

pub use error::DhtError;
pub use message::{Krpc, KrpcBody, Query, ResponseData};
pub use node::{CompactPeer, Distance, Node, NodeId, NodeInfo};
pub use server::{DhtConfig, DhtServer, PeerStream, PeerStreamValue};
