//! Per-connection protocol state.
//!
//! A [`Conn`] is owned by its torrent and mutated only from the client
//! actor, so its fields are plain data. The socket itself lives in the
//! reader and writer tasks; the conn holds the outbound queue handle and
//! the closed flag both tasks watch.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::watch;

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::id::PeerId;
use super::outbox::Outbox;
use super::wire::Message;
use crate::constants::{DEFAULT_PEER_MAX_REQUESTS, MAX_PEER_REQUESTS};
use crate::torrent::{PeerSource, Request};

/// Stable opaque handle to a connection within its torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

/// State of one peer session.
pub struct Conn {
    pub id: ConnId,
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub peer_id: PeerId,
    pub peer_extensions: [u8; 8],
    fast_negotiated: bool,

    // Our side of the session.
    pub interested: bool,
    /// True while we are choking the peer.
    pub choked: bool,
    requests: HashSet<Request>,
    pub requests_low_water: usize,
    sent_haves: Bitfield,

    // The peer's side.
    pub peer_interested: bool,
    /// True while the peer is choking us.
    pub peer_choked: bool,
    peer_pieces: Bitfield,
    pub peer_has_all: bool,
    /// Lower bound on the torrent's piece count implied by peer messages.
    pub peer_min_pieces: u32,
    pub peer_requests: HashSet<Request>,
    pub peer_allowed_fast: HashSet<u32>,
    pub peer_max_requests: usize,
    have_state_received: bool,

    pub completed_handshake: Instant,
    pub last_message_received: Instant,
    pub last_useful_chunk_received: Option<Instant>,
    pub last_chunk_sent: Option<Instant>,
    pub useful_chunks_received: u64,
    pub unwanted_chunks_received: u64,
    pub chunks_sent: u64,

    outbox: Outbox,
    closed_tx: watch::Sender<bool>,
}

impl Conn {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        source: PeerSource,
        peer_id: PeerId,
        peer_extensions: [u8; 8],
        fast_negotiated: bool,
        num_pieces: usize,
        outbox: Outbox,
        closed_tx: watch::Sender<bool>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            source,
            peer_id,
            peer_extensions,
            fast_negotiated,
            interested: false,
            choked: true,
            requests: HashSet::new(),
            requests_low_water: 0,
            sent_haves: Bitfield::new(num_pieces),
            peer_interested: false,
            peer_choked: true,
            peer_pieces: Bitfield::new(num_pieces),
            peer_has_all: false,
            peer_min_pieces: 0,
            peer_requests: HashSet::new(),
            peer_allowed_fast: HashSet::new(),
            peer_max_requests: DEFAULT_PEER_MAX_REQUESTS,
            have_state_received: false,
            completed_handshake: now,
            last_message_received: now,
            last_useful_chunk_received: None,
            last_chunk_sent: None,
            useful_chunks_received: 0,
            unwanted_chunks_received: 0,
            chunks_sent: 0,
            outbox,
            closed_tx,
        }
    }

    /// Both handshakes advertised the fast extension.
    pub fn supports_fast(&self) -> bool {
        self.fast_negotiated
    }

    pub fn peer_has_piece(&self, index: u32) -> bool {
        self.peer_has_all || self.peer_pieces.has(index as usize)
    }

    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn request_pending(&self, r: &Request) -> bool {
        self.requests.contains(r)
    }

    /// Signals the reader and writer loops to exit. Idempotent.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    pub fn post(&self, msg: Message) {
        self.outbox.post(msg);
    }

    // --- send side ------------------------------------------------------

    /// Sends Interested/NotInterested only on a transition. Returns whether
    /// the wire state changed.
    pub fn set_interested(&mut self, interested: bool) -> bool {
        if self.interested == interested {
            return false;
        }
        self.interested = interested;
        self.post(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
        true
    }

    pub fn choke_peer(&mut self) {
        if self.choked {
            return;
        }
        self.choked = true;
        self.peer_requests.clear();
        self.post(Message::Choke);
    }

    pub fn unchoke_peer(&mut self) {
        if !self.choked {
            return;
        }
        self.choked = false;
        self.post(Message::Unchoke);
    }

    /// Announces a piece unless this connection already heard about it.
    pub fn send_have(&mut self, piece: u32) {
        if self.sent_haves.has(piece as usize) {
            return;
        }
        self.sent_haves.set(piece as usize);
        self.post(Message::Have { piece });
    }

    pub fn send_bitfield(&mut self, bitfield: &Bitfield) {
        self.sent_haves = bitfield.clone();
        self.post(Message::Bitfield(bitfield.to_bytes()));
    }

    pub fn send_have_all(&mut self) {
        let n = self.sent_haves.piece_count();
        for i in 0..n {
            self.sent_haves.set(i);
        }
        self.post(Message::HaveAll);
    }

    pub fn send_have_none(&mut self) {
        self.post(Message::HaveNone);
    }

    /// Records and transmits a request. The caller enforces the cap.
    pub fn issue_request(&mut self, r: Request) {
        if !self.requests.insert(r) {
            return;
        }
        self.requests_low_water = self.requests.len() / 2;
        self.post(Message::Request {
            index: r.piece,
            begin: r.chunk.begin,
            length: r.chunk.length,
        });
    }

    /// Cancels an outstanding request, if it is one. Returns whether it was.
    pub fn cancel_request(&mut self, r: Request) -> bool {
        if !self.requests.remove(&r) {
            return false;
        }
        self.post(Message::Cancel {
            index: r.piece,
            begin: r.chunk.begin,
            length: r.chunk.length,
        });
        true
    }

    /// Forgets a request without emitting Cancel (delivered or rejected).
    pub fn remove_request(&mut self, r: &Request) -> bool {
        self.requests.remove(r)
    }

    // --- receive side ---------------------------------------------------

    /// Peer choked us. Non-fast peers implicitly reject everything we had
    /// outstanding; fast peers keep their queue. Returns the released
    /// requests so the torrent can drop its bookkeeping too.
    pub fn peer_sent_choke(&mut self) -> Vec<Request> {
        self.peer_choked = true;
        if self.fast_negotiated {
            return Vec::new();
        }
        self.requests.drain().collect()
    }

    pub fn peer_sent_unchoke(&mut self) {
        self.peer_choked = false;
    }

    /// Records a Have. Returns true when the bit was newly set.
    pub fn peer_sent_have(&mut self, piece: u32, num_pieces: usize) -> Result<bool, PeerError> {
        if piece as usize >= num_pieces {
            return Err(PeerError::Protocol("have index out of range"));
        }
        self.have_state_received = true;
        self.peer_min_pieces = self.peer_min_pieces.max(piece + 1);
        if self.peer_has_piece(piece) {
            return Ok(false);
        }
        self.peer_pieces.set(piece as usize);
        Ok(true)
    }

    /// Records a Bitfield, legal at most once and only before any other
    /// have-related message. Known-excess bits are truncated.
    pub fn peer_sent_bitfield(&mut self, bits: &Bytes, num_pieces: usize) -> Result<(), PeerError> {
        if self.have_state_received {
            return Err(PeerError::Protocol("bitfield not first have message"));
        }
        self.have_state_received = true;
        self.peer_has_all = false;
        self.peer_pieces = Bitfield::from_bytes(bits, num_pieces);
        // The wire length alone proves at most the last 7 bits are padding.
        self.peer_min_pieces = self
            .peer_min_pieces
            .max((bits.len() * 8).saturating_sub(7) as u32);
        Ok(())
    }

    pub fn peer_sent_have_all(&mut self) {
        self.have_state_received = true;
        self.peer_has_all = true;
    }

    pub fn peer_sent_have_none(&mut self) {
        self.have_state_received = true;
        self.peer_has_all = false;
        self.peer_pieces = Bitfield::new(self.peer_pieces.piece_count());
    }

    /// Queues an inbound request, bounded so a peer cannot balloon memory.
    pub fn add_peer_request(&mut self, r: Request) -> bool {
        if self.peer_requests.len() >= MAX_PEER_REQUESTS {
            return false;
        }
        self.peer_requests.insert(r)
    }

    pub fn remove_peer_request(&mut self, r: &Request) -> bool {
        self.peer_requests.remove(r)
    }

    pub fn add_allowed_fast(&mut self, piece: u32) {
        self.peer_allowed_fast.insert(piece);
    }

    pub fn record_useful_chunk(&mut self) {
        self.useful_chunks_received += 1;
        self.last_useful_chunk_received = Some(Instant::now());
    }

    pub fn record_chunk_sent(&mut self) {
        self.chunks_sent += 1;
        self.last_chunk_sent = Some(Instant::now());
    }
}
