//! Per-torrent swarm state.
//!
//! A [`Torrent`] owns its piece table, its connections, the queue of peers we
//! have not dialed yet, and the cross-connection request bookkeeping the
//! scheduler relies on. All of it is mutated only from the client actor task,
//! so none of these fields carry locks.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;

use crate::constants::CHUNK_SIZE;
use crate::peer::{Bitfield, Conn, ConnId, PeerId};

/// 20-byte torrent identifier; the key of the client's torrent registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InfoHash({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Where a peer record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Incoming,
    Dht,
    Pex,
}

/// An undialed peer as handed to us by a discovery source.
#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
    /// Known only for some sources; confirmed at handshake either way.
    pub id: Option<PeerId>,
    pub source: PeerSource,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// A byte range within a piece; the unit of a wire request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkSpec {
    pub begin: u32,
    pub length: u32,
}

/// A chunk request, unique within a connection's outstanding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    pub piece: u32,
    pub chunk: ChunkSpec,
}

impl Request {
    pub fn new(piece: u32, begin: u32, length: u32) -> Self {
        Self {
            piece,
            chunk: ChunkSpec { begin, length },
        }
    }
}

/// Download priority of a piece. `None` excludes it from scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PiecePriority {
    None,
    Normal,
    Readahead,
    Next,
    Now,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Not yet verified against its hash.
    Unknown,
    /// Stored bytes hash to the expected sum.
    Complete,
    /// Missing at least one chunk.
    Incomplete,
}

/// One piece of the torrent.
#[derive(Debug)]
pub struct Piece {
    pub hash: [u8; 20],
    pub state: PieceState,
    /// Chunks still to be fetched; populated on the transition to Incomplete
    /// and kept as an exact cover of the unfetched remainder.
    pub pending_chunks: BTreeSet<ChunkSpec>,
    pub priority: PiecePriority,
    /// Chunk writes handed to storage but not yet acknowledged. Verification
    /// waits until this drains so the hash never reads a torn piece.
    pub inflight_writes: usize,
}

impl Piece {
    fn new(hash: [u8; 20]) -> Self {
        Self {
            hash,
            state: PieceState::Unknown,
            pending_chunks: BTreeSet::new(),
            priority: PiecePriority::Normal,
            inflight_writes: 0,
        }
    }
}

/// A file declared by the torrent's metainfo.
#[derive(Debug, Clone)]
pub struct MetaFile {
    /// Path relative to the torrent name directory.
    pub path: PathBuf,
    pub length: u64,
}

/// The already-parsed metainfo descriptor the engine consumes.
///
/// Parsing `.torrent` files and magnet links happens elsewhere; this is the
/// result: the infohash, piece geometry, and ordered SHA-1 piece sums.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<MetaFile>,
}

impl TorrentMeta {
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// True when the hash count matches the declared lengths.
    pub fn is_consistent(&self) -> bool {
        if self.piece_length == 0 {
            return false;
        }
        let expected = self.total_length.div_ceil(self.piece_length as u64);
        expected == self.piece_hashes.len() as u64
    }
}

/// Per-infohash swarm state, owned by the client actor.
pub struct Torrent {
    pub meta: TorrentMeta,
    pub pieces: Vec<Piece>,
    pub conns: HashMap<ConnId, Conn>,
    /// Discovered but undialed peers.
    pub peers: VecDeque<Peer>,
    /// Which connection is responsible for each outstanding request.
    pub pending_requests: HashMap<Request, ConnId>,
    /// When each outstanding request was last issued.
    pub last_requested: HashMap<Request, Instant>,
    pub closed: bool,
}

impl Torrent {
    pub fn new(meta: TorrentMeta) -> Self {
        let pieces = meta.piece_hashes.iter().map(|h| Piece::new(*h)).collect();
        Self {
            meta,
            pieces,
            conns: HashMap::new(),
            peers: VecDeque::new(),
            pending_requests: HashMap::new(),
            last_requested: HashMap::new(),
            closed: false,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Size of piece `index`, honoring the short last piece.
    pub fn piece_size(&self, index: u32) -> u32 {
        let n = self.num_pieces() as u32;
        if index + 1 == n {
            let rem = self.meta.total_length % self.meta.piece_length as u64;
            if rem != 0 {
                return rem as u32;
            }
        }
        self.meta.piece_length
    }

    /// The full chunk set of a piece: 16 KiB chunks with a short tail.
    pub fn piece_chunk_specs(&self, index: u32) -> BTreeSet<ChunkSpec> {
        let size = self.piece_size(index);
        let mut specs = BTreeSet::new();
        let mut begin = 0u32;
        while begin < size {
            let length = CHUNK_SIZE.min(size - begin);
            specs.insert(ChunkSpec { begin, length });
            begin += length;
        }
        specs
    }

    /// True when the piece is worth requesting from peers.
    pub fn want_piece(&self, index: u32) -> bool {
        match self.pieces.get(index as usize) {
            Some(p) => p.state == PieceState::Incomplete && p.priority > PiecePriority::None,
            None => false,
        }
    }

    pub fn have_piece(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.state == PieceState::Complete)
    }

    pub fn have_any_pieces(&self) -> bool {
        self.pieces.iter().any(|p| p.state == PieceState::Complete)
    }

    pub fn have_all_pieces(&self) -> bool {
        self.pieces.iter().all(|p| p.state == PieceState::Complete)
    }

    pub fn completed_pieces(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| p.state == PieceState::Complete)
            .count()
    }

    /// Bitmap of complete pieces, as sent in a Bitfield message.
    pub fn bitfield(&self) -> Bitfield {
        let mut bf = Bitfield::new(self.num_pieces());
        for (i, piece) in self.pieces.iter().enumerate() {
            if piece.state == PieceState::Complete {
                bf.set(i);
            }
        }
        bf
    }

    /// How many connected peers advertise piece `index`.
    pub fn availability(&self, index: u32) -> usize {
        self.conns
            .values()
            .filter(|c| c.peer_has_piece(index))
            .count()
    }

    /// Cross-peer request pressure: how many connections currently have each
    /// request outstanding.
    pub fn request_heat(&self) -> HashMap<Request, usize> {
        let mut heat = HashMap::new();
        for conn in self.conns.values() {
            for r in conn.requests() {
                *heat.entry(*r).or_insert(0) += 1;
            }
        }
        heat
    }

    /// Forgets every request a connection owns. Called when the connection
    /// goes away or its outstanding set is implicitly rejected.
    pub fn release_conn_requests(&mut self, id: ConnId) {
        let last_requested = &mut self.last_requested;
        self.pending_requests.retain(|r, owner| {
            if *owner == id {
                last_requested.remove(r);
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CHUNK_SIZE;

    fn meta(piece_length: u32, total_length: u64) -> TorrentMeta {
        let num_pieces = total_length.div_ceil(piece_length as u64) as usize;
        TorrentMeta {
            info_hash: InfoHash([3u8; 20]),
            name: "content".into(),
            piece_length,
            total_length,
            piece_hashes: vec![[0u8; 20]; num_pieces],
            files: vec![MetaFile {
                path: "content.bin".into(),
                length: total_length,
            }],
        }
    }

    #[test]
    fn piece_size_honors_short_last_piece() {
        let t = Torrent::new(meta(0x8000, 0x8000 * 2 + 100));
        assert_eq!(t.num_pieces(), 3);
        assert_eq!(t.piece_size(0), 0x8000);
        assert_eq!(t.piece_size(1), 0x8000);
        assert_eq!(t.piece_size(2), 100);

        let even = Torrent::new(meta(0x8000, 0x8000 * 2));
        assert_eq!(even.piece_size(1), 0x8000);
    }

    #[test]
    fn chunk_specs_exactly_cover_the_piece() {
        let t = Torrent::new(meta(0x8000, 0x8000 * 2 + 100));
        for index in 0..t.num_pieces() as u32 {
            let specs = t.piece_chunk_specs(index);
            let mut expected_begin = 0u32;
            for spec in &specs {
                assert_eq!(spec.begin, expected_begin);
                assert!(spec.length <= CHUNK_SIZE);
                assert!(spec.length > 0);
                expected_begin += spec.length;
            }
            assert_eq!(expected_begin, t.piece_size(index));
        }
        // 100-byte tail piece is one short chunk.
        assert_eq!(t.piece_chunk_specs(2).len(), 1);
    }

    #[test]
    fn want_piece_requires_incomplete_and_priority() {
        let mut t = Torrent::new(meta(0x4000, 0x4000 * 2));
        assert!(!t.want_piece(0));

        t.pieces[0].state = PieceState::Incomplete;
        assert!(t.want_piece(0));

        t.pieces[0].priority = PiecePriority::None;
        assert!(!t.want_piece(0));

        t.pieces[1].state = PieceState::Complete;
        assert!(!t.want_piece(1));
        assert!(!t.want_piece(9));
    }

    #[test]
    fn bitfield_tracks_complete_pieces() {
        let mut t = Torrent::new(meta(0x4000, 0x4000 * 10));
        assert!(!t.have_any_pieces());
        t.pieces[0].state = PieceState::Complete;
        t.pieces[9].state = PieceState::Complete;
        let bf = t.bitfield();
        assert!(bf.has(0));
        assert!(!bf.has(1));
        assert!(bf.has(9));
        assert!(t.have_any_pieces());
        assert!(!t.have_all_pieces());
        assert_eq!(t.completed_pieces(), 2);
    }

    #[test]
    fn descriptor_consistency_check() {
        assert!(meta(0x4000, 0x4000 * 3).is_consistent());
        let mut bad = meta(0x4000, 0x4000 * 3);
        bad.piece_hashes.pop();
        assert!(!bad.is_consistent());
        bad.piece_length = 0;
        assert!(!bad.is_consistent());
    }
}
