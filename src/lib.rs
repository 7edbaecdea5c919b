//! gtor - a BitTorrent swarm engine.
//!
//! The engine covers the peer wire protocol (BEP-3 with the BEP-6 fast
//! extension), per-torrent piece and chunk scheduling, and a BEP-5 DHT for
//! trackerless peer discovery. Metainfo parsing, tracker scraping, and
//! stream obfuscation are external collaborators: the engine consumes an
//! already-parsed [`torrent::TorrentMeta`] descriptor, a stream of
//! [`torrent::Peer`] records from any discovery source, and a
//! [`storage::PieceStore`] for chunk I/O and piece hashing.
//!
//! # Modules
//!
//! - [`client`] - the orchestrator actor: torrent registry, dial pool, listener
//! - [`torrent`] - per-torrent piece map and request bookkeeping
//! - [`peer`] - wire codec, connection state machine, outbound queue
//! - [`sched`] - the per-connection request scheduler
//! - [`dht`] - KRPC over UDP: routing table, queries, bootstrap
//! - [`storage`] - the piece store interface and its file-backed implementation
//! - [`bencode`] - BEP-3 value model used by KRPC

pub mod bencode;
pub mod client;
pub mod constants;
pub mod dht;
pub mod metrics;
pub mod peer;
pub mod sched;
pub mod storage;
pub mod torrent;

pub use client::{Client, ClientError, Config, TorrentStatus};
pub use dht::{DhtConfig, DhtServer, NodeId, PeerStream};
pub use metrics::Metrics;
pub use peer::{Bitfield, Handshake, Message, PeerId};
pub use storage::{FileStore, MemoryStore, PieceStore, StorageError};
pub use torrent::{InfoHash, Peer, PeerSource, PiecePriority, TorrentMeta};
