//! Client orchestrator.
//!
//! One cooperative actor task owns every torrent and connection. State
//! mutations are posted onto an unbounded task channel and run to
//! completion one at a time, so the invariants in [`crate::torrent`] hold
//! at task boundaries without any per-field locking. Socket loops and
//! hashing run on their own tasks and only post back.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_HALF_OPEN_LIMIT, DEFAULT_REQUEST_CAP, KEEPALIVE_INTERVAL};
use crate::dht::DhtServer;
use crate::metrics::Metrics;
use crate::peer::{
    self, Conn, ConnId, Handshake, Message, Outbox, PeerError, PeerId,
};
use crate::sched;
use crate::storage::PieceStore;
use crate::torrent::{
    InfoHash, Peer, PeerSource, PiecePriority, PieceState, Request, Torrent, TorrentMeta,
};

/// Largest single chunk we will serve to a peer.
const MAX_SERVE_LEN: u32 = 128 * 1024;

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept incoming peers on; `None` disables the listener.
    pub listen_addr: Option<SocketAddr>,
    /// Concurrent outbound dials in progress.
    pub half_open_limit: usize,
    /// Hard cap on outstanding requests per connection.
    pub request_cap: usize,
    /// Idle interval before a keepalive is written.
    pub keepalive_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: None,
            half_open_limit: DEFAULT_HALF_OPEN_LIMIT,
            request_cap: DEFAULT_REQUEST_CAP,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("torrent already registered")]
    DuplicateTorrent,

    #[error("inconsistent torrent descriptor")]
    BadDescriptor,

    #[error("no such torrent")]
    UnknownTorrent,

    #[error("no dht server attached")]
    NoDht,

    #[error("client closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A snapshot of one torrent's progress.
#[derive(Debug, Clone)]
pub struct TorrentStatus {
    pub info_hash: InfoHash,
    pub num_pieces: usize,
    pub completed_pieces: usize,
    pub connections: usize,
}

type Task = Box<dyn FnOnce(&mut State) + Send>;

struct Shared {
    tx: mpsc::UnboundedSender<Task>,
    peer_id: PeerId,
    config: Config,
    metrics: Arc<Metrics>,
    local_addr: Option<SocketAddr>,
    dht: OnceLock<Arc<DhtServer>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn post(self: &Arc<Self>, task: impl FnOnce(&mut State) + Send + 'static) {
        let _ = self.tx.send(Box::new(task));
    }
}

struct Entry {
    torrent: Torrent,
    store: Arc<dyn PieceStore>,
}

struct State {
    shared: Arc<Shared>,
    torrents: HashMap<InfoHash, Entry>,
    half_open: usize,
    next_conn: u64,
    waiters: Vec<oneshot::Sender<()>>,
    closed: bool,
}

/// Handle to a running client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Starts the actor task and, when configured, the incoming listener.
    pub async fn new(config: Config) -> Result<Self, ClientError> {
        let peer_id = PeerId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let listener = match config.listen_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let local_addr = match &listener {
            Some(l) => Some(l.local_addr()?),
            None => None,
        };
        let shared = Arc::new(Shared {
            tx,
            peer_id,
            config,
            metrics: Arc::new(Metrics::new()),
            local_addr,
            dht: OnceLock::new(),
            shutdown,
        });
        let state = State {
            shared: shared.clone(),
            torrents: HashMap::new(),
            half_open: 0,
            next_conn: 0,
            waiters: Vec::new(),
            closed: false,
        };
        tokio::spawn(run_actor(rx, state));
        if let Some(listener) = listener {
            tokio::spawn(accept_loop(shared.clone(), listener));
        }
        info!(peer_id = ?peer_id, "client started");
        Ok(Self { shared })
    }

    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    /// The bound listener address, when a listener is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    /// Wires a DHT server in so Port messages feed it and
    /// [`Client::discover_peers`] can run traversals.
    pub fn attach_dht(&self, dht: Arc<DhtServer>) {
        let _ = self.shared.dht.set(dht);
    }

    /// Registers a torrent. Pieces start unverified and are hashed in the
    /// background; verified-complete pieces never hit the network.
    pub async fn add_torrent(
        &self,
        meta: TorrentMeta,
        store: Arc<dyn PieceStore>,
    ) -> Result<(), ClientError> {
        if !meta.is_consistent() {
            return Err(ClientError::BadDescriptor);
        }
        let (tx, rx) = oneshot::channel();
        self.post(move |s| {
            let result = s.add_torrent(meta, store);
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Feeds discovered peers into a torrent's dial queue.
    pub async fn add_peers(&self, ih: InfoHash, peers: Vec<Peer>) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(move |s| {
            let result = match s.torrents.get_mut(&ih) {
                Some(entry) => {
                    entry.torrent.peers.extend(peers);
                    s.open_new_conns();
                    Ok(())
                }
                None => Err(ClientError::UnknownTorrent),
            };
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Adjusts one piece's priority and reschedules affected peers.
    pub async fn set_piece_priority(
        &self,
        ih: InfoHash,
        piece: u32,
        priority: PiecePriority,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(move |s| {
            let _ = tx.send(s.set_piece_priority(ih, piece, priority));
        })?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Progress snapshots for every registered torrent.
    pub async fn torrents(&self) -> Result<Vec<TorrentStatus>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(move |s| {
            let statuses = s
                .torrents
                .values()
                .map(|e| TorrentStatus {
                    info_hash: e.torrent.meta.info_hash,
                    num_pieces: e.torrent.num_pieces(),
                    completed_pieces: e.torrent.completed_pieces(),
                    connections: e.torrent.conns.len(),
                })
                .collect();
            let _ = tx.send(statuses);
        })?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Drops a torrent: closes its connections and forgets it.
    pub async fn remove_torrent(&self, ih: InfoHash) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(move |s| {
            s.remove_torrent(ih);
            let _ = tx.send(());
        })?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Blocks until the torrent registry is empty.
    pub async fn wait_all(&self) {
        let (tx, rx) = oneshot::channel();
        if self.post(move |s| s.waiters.push(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Shuts everything down: listener, connections, DHT, registry.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .post(move |s| {
                s.close();
                let _ = tx.send(());
            })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    /// Runs a DHT get_peers traversal and funnels results into the dial
    /// queue until the traversal drains.
    pub fn discover_peers(&self, ih: InfoHash) -> Result<(), ClientError> {
        let dht = self.shared.dht.get().cloned().ok_or(ClientError::NoDht)?;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut stream = dht.get_peers(ih.0);
            while let Some(value) = stream.recv().await {
                let peers: Vec<Peer> = value
                    .peers
                    .into_iter()
                    .map(|addr| Peer {
                        ip: IpAddr::V4(*addr.ip()),
                        port: addr.port(),
                        id: None,
                        source: PeerSource::Dht,
                    })
                    .collect();
                debug!(count = peers.len(), from = %value.from, "dht peers discovered");
                shared.post(move |s| {
                    if let Some(entry) = s.torrents.get_mut(&ih) {
                        entry.torrent.peers.extend(peers);
                    }
                    s.open_new_conns();
                });
            }
        });
        Ok(())
    }

    fn post(&self, task: impl FnOnce(&mut State) + Send + 'static) -> Result<(), ClientError> {
        self.shared
            .tx
            .send(Box::new(task))
            .map_err(|_| ClientError::Closed)
    }
}

async fn run_actor(mut rx: mpsc::UnboundedReceiver<Task>, mut state: State) {
    while let Some(task) = rx.recv().await {
        task(&mut state);
        // The wait-all channel is served only while the registry is empty.
        if state.torrents.is_empty() {
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(());
            }
            if state.closed {
                return;
            }
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    tokio::spawn(accept_conn(shared.clone(), stream, addr));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

/// Responder half of the handshake: read the remote's infohash first, only
/// then commit our own handshake, so one listener serves every torrent.
async fn accept_conn(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
    let (reserved, ih_bytes) = match peer::read_handshake_prefix(&mut stream).await {
        Ok(prefix) => prefix,
        Err(err) => {
            debug!(%addr, %err, "bad incoming handshake");
            return;
        }
    };
    let ih = InfoHash(ih_bytes);

    let (tx, rx) = oneshot::channel();
    shared.post(move |s| {
        let known = s
            .torrents
            .get(&ih)
            .map(|e| !e.torrent.closed)
            .unwrap_or(false);
        let _ = tx.send(known);
    });
    match rx.await {
        Ok(true) => {}
        _ => {
            debug!(%addr, torrent = %ih, "incoming handshake for unknown torrent");
            return;
        }
    }

    let ours = Handshake::new(ih.0, shared.peer_id.0);
    if let Err(err) = peer::send_handshake(&mut stream, &ours).await {
        debug!(%addr, %err, "failed to answer handshake");
        return;
    }
    let peer_id = match peer::read_handshake_peer_id(&mut stream).await {
        Ok(id) => id,
        Err(err) => {
            debug!(%addr, %err, "truncated incoming handshake");
            return;
        }
    };
    let handshake = Handshake {
        reserved,
        info_hash: ih.0,
        peer_id,
    };
    shared.post(move |s| {
        s.install_connection(ih, stream, addr, handshake, PeerSource::Incoming)
    });
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    ih: InfoHash,
    cid: ConnId,
    mut reader: R,
    mut closed: watch::Receiver<bool>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    use tokio::io::AsyncReadExt;

    let mut buf = BytesMut::with_capacity(32 * 1024);
    let reason = loop {
        match Message::decode_frame(&mut buf) {
            Ok(Some(msg)) => {
                shared.post(move |s| s.handle_message(ih, cid, msg));
                continue;
            }
            Ok(None) => {}
            // An unknown type byte skips that frame; everything else about
            // the stream is still intact.
            Err(PeerError::UnknownMessageId(id)) => {
                debug!(conn = cid.0, id, "ignoring unknown message type");
                continue;
            }
            Err(err) => break Some(err),
        }
        tokio::select! {
            res = reader.read_buf(&mut buf) => match res {
                Ok(0) => break Some(PeerError::Closed),
                Ok(_) => {}
                Err(err) => break Some(err.into()),
            },
            _ = closed.changed() => break None,
        }
    };
    if let Some(err) = reason {
        debug!(conn = cid.0, %err, "peer read loop ended");
        shared.post(move |s| s.drop_connection(ih, cid));
    }
}

impl State {
    fn add_torrent(&mut self, meta: TorrentMeta, store: Arc<dyn PieceStore>) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        let ih = meta.info_hash;
        if self.torrents.contains_key(&ih) {
            return Err(ClientError::DuplicateTorrent);
        }
        let torrent = Torrent::new(meta);
        let num_pieces = torrent.num_pieces() as u32;
        let hashes = torrent.meta.piece_hashes.clone();
        self.torrents.insert(ih, Entry { torrent, store: store.clone() });
        info!(torrent = %ih, pieces = num_pieces, "torrent added");

        // Startup verification: every piece is hashed once, off-actor, and
        // the verdicts stream back through piece_hashed.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            for index in 0..num_pieces {
                let correct = match store.hash_piece(index).await {
                    Ok(sum) => sum == hashes[index as usize],
                    Err(err) => {
                        warn!(torrent = %ih, piece = index, %err, "initial hash failed");
                        false
                    }
                };
                shared.post(move |s| s.piece_hashed(ih, index, correct));
            }
        });
        Ok(())
    }

    fn remove_torrent(&mut self, ih: InfoHash) {
        if let Some(entry) = self.torrents.remove(&ih) {
            for conn in entry.torrent.conns.values() {
                conn.close();
            }
            info!(torrent = %ih, "torrent removed");
        }
    }

    fn close(&mut self) {
        self.closed = true;
        let ihs: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for ih in ihs {
            self.remove_torrent(ih);
        }
        if let Some(dht) = self.shared.dht.get() {
            dht.close();
        }
        let _ = self.shared.shutdown.send(true);
    }

    fn set_piece_priority(
        &mut self,
        ih: InfoHash,
        piece: u32,
        priority: PiecePriority,
    ) -> Result<(), ClientError> {
        let cap = self.shared.config.request_cap;
        let entry = self.torrents.get_mut(&ih).ok_or(ClientError::UnknownTorrent)?;
        let t = &mut entry.torrent;
        match t.pieces.get_mut(piece as usize) {
            Some(p) => p.priority = priority,
            None => return Err(ClientError::UnknownTorrent),
        }
        let ids: Vec<ConnId> = t
            .conns
            .iter()
            .filter(|(_, c)| c.peer_has_piece(piece))
            .map(|(id, _)| *id)
            .collect();
        for cid in ids {
            sched::update_requests(t, cid, cap);
        }
        Ok(())
    }

    /// Drains dial queues into outbound connections, within the half-open
    /// budget.
    fn open_new_conns(&mut self) {
        let ihs: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for ih in ihs {
            loop {
                if self.half_open >= self.shared.config.half_open_limit {
                    return;
                }
                let peer = match self.torrents.get_mut(&ih) {
                    Some(entry) if !entry.torrent.closed => {
                        match entry.torrent.peers.pop_front() {
                            Some(peer) => peer,
                            None => break,
                        }
                    }
                    _ => break,
                };
                self.initiate_conn(ih, peer);
            }
        }
    }

    fn initiate_conn(&mut self, ih: InfoHash, peer: Peer) {
        if peer.id == Some(self.shared.peer_id) {
            debug!(peer = %peer.addr(), "not dialing ourselves");
            return;
        }
        self.half_open += 1;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let dialed = TcpStream::connect(peer.addr()).await;
            // The dial slot frees as soon as the connect resolves, pass or
            // fail; the handshake happens outside the budget.
            shared.post(|s| {
                s.half_open = s.half_open.saturating_sub(1);
                s.open_new_conns();
            });
            let mut stream = match dialed {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(peer = %peer.addr(), %err, "dial failed");
                    return;
                }
            };
            match peer::connect_handshake(&mut stream, ih.0, shared.peer_id.0).await {
                Ok(handshake) => {
                    let addr = peer.addr();
                    let source = peer.source;
                    shared.post(move |s| {
                        s.install_connection(ih, stream, addr, handshake, source)
                    });
                }
                Err(err) => {
                    debug!(peer = %peer.addr(), %err, "outbound handshake failed");
                }
            }
        });
    }

    /// Installs a handshaken socket as a connection: dedup checks, initial
    /// have announcement, reader and writer tasks.
    fn install_connection<S>(
        &mut self,
        ih: InfoHash,
        stream: S,
        addr: SocketAddr,
        handshake: Handshake,
        source: PeerSource,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.closed {
            return;
        }
        let shared = self.shared.clone();
        let Some(entry) = self.torrents.get_mut(&ih) else {
            return;
        };
        let t = &mut entry.torrent;
        if t.closed {
            return;
        }
        let peer_id = PeerId(handshake.peer_id);
        if peer_id == shared.peer_id {
            debug!(%addr, "dropping connection to ourselves");
            return;
        }
        if t.conns.values().any(|c| c.peer_id == peer_id) {
            debug!(%addr, ?peer_id, "dropping duplicate peer id");
            return;
        }

        let cid = ConnId(self.next_conn);
        self.next_conn += 1;
        let outbox = Outbox::new(shared.metrics.clone());
        let (closed_tx, closed_rx) = watch::channel(false);
        let fast = handshake.supports_fast();
        let mut conn = Conn::new(
            cid,
            addr,
            source,
            peer_id,
            handshake.reserved,
            fast,
            t.num_pieces(),
            outbox.clone(),
            closed_tx,
        );

        if fast && t.num_pieces() > 0 && t.have_all_pieces() {
            conn.send_have_all();
        } else if fast && !t.have_any_pieces() {
            conn.send_have_none();
        } else if t.have_any_pieces() {
            conn.send_bitfield(&t.bitfield());
        }
        t.conns.insert(cid, conn);
        info!(%addr, torrent = %ih, conn = cid.0, ?source, "peer connected");

        let (read_half, write_half) = tokio::io::split(stream);
        let writer_shared = shared.clone();
        let writer_closed = closed_rx.clone();
        let keepalive = shared.config.keepalive_interval;
        let metrics = shared.metrics.clone();
        tokio::spawn(async move {
            if let Err(err) =
                peer::write_loop(outbox, write_half, writer_closed, keepalive, metrics).await
            {
                debug!(conn = cid.0, %err, "peer write loop failed");
                writer_shared.post(move |s| s.drop_connection(ih, cid));
            }
        });
        tokio::spawn(read_loop(shared, ih, cid, read_half, closed_rx));
    }

    fn drop_connection(&mut self, ih: InfoHash, cid: ConnId) {
        let cap = self.shared.config.request_cap;
        let Some(entry) = self.torrents.get_mut(&ih) else {
            return;
        };
        let t = &mut entry.torrent;
        let Some(conn) = t.conns.remove(&cid) else {
            return;
        };
        conn.close();
        t.release_conn_requests(cid);
        debug!(torrent = %ih, conn = cid.0, "connection dropped");
        // Availability changed; revisit everyone else's requests.
        let ids: Vec<ConnId> = t.conns.keys().copied().collect();
        for other in ids {
            sched::update_requests(t, other, cap);
        }
    }

    fn handle_message(&mut self, ih: InfoHash, cid: ConnId, msg: Message) {
        if let Err(err) = self.peer_message(ih, cid, msg) {
            warn!(torrent = %ih, conn = cid.0, %err, "dropping connection");
            self.drop_connection(ih, cid);
        }
    }

    fn peer_message(&mut self, ih: InfoHash, cid: ConnId, msg: Message) -> Result<(), PeerError> {
        let cap = self.shared.config.request_cap;
        let shared = self.shared.clone();
        let Some(entry) = self.torrents.get_mut(&ih) else {
            return Ok(());
        };
        let t = &mut entry.torrent;
        let n = t.num_pieces();
        let conn_addr = {
            let Some(conn) = t.conns.get_mut(&cid) else {
                // Already dropped; late messages are not an error.
                return Ok(());
            };
            conn.last_message_received = Instant::now();
            if msg.requires_fast() && !conn.supports_fast() {
                return Err(PeerError::Protocol("fast message without negotiation"));
            }
            conn.addr
        };

        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                let released = t
                    .conns
                    .get_mut(&cid)
                    .map(|c| c.peer_sent_choke())
                    .unwrap_or_default();
                for r in released {
                    if t.pending_requests.get(&r) == Some(&cid) {
                        t.pending_requests.remove(&r);
                        t.last_requested.remove(&r);
                    }
                }
            }
            Message::Unchoke => {
                if let Some(conn) = t.conns.get_mut(&cid) {
                    conn.peer_sent_unchoke();
                }
                sched::update_requests(t, cid, cap);
            }
            Message::Interested => {
                if let Some(conn) = t.conns.get_mut(&cid) {
                    conn.peer_interested = true;
                    // Basic allow policy: anyone interested gets unchoked.
                    conn.unchoke_peer();
                }
            }
            Message::NotInterested => {
                if let Some(conn) = t.conns.get_mut(&cid) {
                    conn.peer_interested = false;
                    conn.choke_peer();
                }
            }
            Message::Have { piece } => {
                let newly = match t.conns.get_mut(&cid) {
                    Some(conn) => conn.peer_sent_have(piece, n)?,
                    None => false,
                };
                if newly && t.want_piece(piece) {
                    sched::update_requests(t, cid, cap);
                }
            }
            Message::Bitfield(bits) => {
                if let Some(conn) = t.conns.get_mut(&cid) {
                    conn.peer_sent_bitfield(&bits, n)?;
                }
                sched::update_requests(t, cid, cap);
            }
            Message::HaveAll => {
                if let Some(conn) = t.conns.get_mut(&cid) {
                    conn.peer_sent_have_all();
                }
                sched::update_requests(t, cid, cap);
            }
            Message::HaveNone => {
                if let Some(conn) = t.conns.get_mut(&cid) {
                    conn.peer_sent_have_none();
                }
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                let r = Request::new(index, begin, length);
                let servable = (index as usize) < n
                    && t.have_piece(index)
                    && length > 0
                    && length <= MAX_SERVE_LEN
                    && begin as u64 + length as u64 <= t.piece_size(index) as u64;
                let Some(conn) = t.conns.get_mut(&cid) else {
                    return Ok(());
                };
                if conn.choked || !servable {
                    if conn.supports_fast() {
                        conn.post(Message::Reject {
                            index,
                            begin,
                            length,
                        });
                    }
                    return Ok(());
                }
                if conn.add_peer_request(r) {
                    let store = entry.store.clone();
                    tokio::spawn(async move {
                        let result = store.read_at(index, begin, length).await;
                        shared.post(move |s| s.serve_chunk(ih, cid, r, result));
                    });
                }
            }
            Message::Piece { index, begin, data } => {
                let r = Request::new(index, begin, data.len() as u32);
                {
                    let Some(conn) = t.conns.get_mut(&cid) else {
                        return Ok(());
                    };
                    if !conn.remove_request(&r) {
                        shared
                            .metrics
                            .unwanted_chunks_received
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        return Err(PeerError::UnexpectedPiece);
                    }
                    conn.record_useful_chunk();
                }
                shared
                    .metrics
                    .useful_chunks_received
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if t.pending_requests.get(&r) == Some(&cid) {
                    t.pending_requests.remove(&r);
                    t.last_requested.remove(&r);
                }
                let Some(piece) = t.pieces.get_mut(index as usize) else {
                    return Err(PeerError::Protocol("piece index out of range"));
                };
                if piece.pending_chunks.remove(&r.chunk) {
                    piece.inflight_writes += 1;
                    let store = entry.store.clone();
                    tokio::spawn(async move {
                        let result = store.write_chunk(index, begin, &data).await;
                        shared.post(move |s| s.chunk_written(ih, r, result));
                    });
                } else {
                    debug!(piece = index, begin, "redundant chunk");
                }
                sched::update_requests(t, cid, cap);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let r = Request::new(index, begin, length);
                if let Some(conn) = t.conns.get_mut(&cid) {
                    conn.remove_peer_request(&r);
                }
            }
            Message::Port(port) => {
                if let Some(dht) = self.shared.dht.get() {
                    dht.add_candidate(SocketAddr::new(conn_addr.ip(), port));
                }
            }
            Message::Suggest { piece } => {
                debug!(conn = cid.0, piece, "peer suggested piece");
            }
            Message::Reject {
                index,
                begin,
                length,
            } => {
                let r = Request::new(index, begin, length);
                let removed = t
                    .conns
                    .get_mut(&cid)
                    .map(|c| c.remove_request(&r))
                    .unwrap_or(false);
                // A reject is not a delivery: the chunk stays pending and
                // goes back into the pool for anyone to pick up.
                if removed && t.pending_requests.get(&r) == Some(&cid) {
                    t.pending_requests.remove(&r);
                    t.last_requested.remove(&r);
                }
                sched::update_requests(t, cid, cap);
            }
            Message::AllowedFast { piece } => {
                if let Some(conn) = t.conns.get_mut(&cid) {
                    conn.add_allowed_fast(piece);
                }
                sched::update_requests(t, cid, cap);
            }
            Message::Extended { id, .. } => {
                debug!(conn = cid.0, ext = id, "ignoring extended message");
            }
        }
        Ok(())
    }

    /// A storage read for an inbound request finished; send the chunk if
    /// the request is still live and we are still not choking.
    fn serve_chunk(
        &mut self,
        ih: InfoHash,
        cid: ConnId,
        r: Request,
        result: Result<bytes::Bytes, crate::storage::StorageError>,
    ) {
        let Some(entry) = self.torrents.get_mut(&ih) else {
            return;
        };
        let Some(conn) = entry.torrent.conns.get_mut(&cid) else {
            return;
        };
        if !conn.remove_peer_request(&r) || conn.choked {
            return;
        }
        match result {
            Ok(data) => {
                conn.post(Message::Piece {
                    index: r.piece,
                    begin: r.chunk.begin,
                    data,
                });
                conn.record_chunk_sent();
                self.shared
                    .metrics
                    .chunks_sent
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(err) => {
                warn!(piece = r.piece, %err, "chunk read failed");
                if conn.supports_fast() {
                    conn.post(Message::Reject {
                        index: r.piece,
                        begin: r.chunk.begin,
                        length: r.chunk.length,
                    });
                }
            }
        }
    }

    /// A chunk write completed. When the piece has no pending chunks and no
    /// writes in flight it goes off for verification.
    fn chunk_written(
        &mut self,
        ih: InfoHash,
        r: Request,
        result: Result<(), crate::storage::StorageError>,
    ) {
        let shared = self.shared.clone();
        let Some(entry) = self.torrents.get_mut(&ih) else {
            return;
        };
        let store = entry.store.clone();
        let Some(piece) = entry.torrent.pieces.get_mut(r.piece as usize) else {
            return;
        };
        piece.inflight_writes = piece.inflight_writes.saturating_sub(1);
        match result {
            Err(err) => {
                warn!(piece = r.piece, %err, "chunk write failed; rescheduling");
                piece.state = PieceState::Incomplete;
                piece.pending_chunks.insert(r.chunk);
            }
            Ok(()) => {
                if piece.pending_chunks.is_empty()
                    && piece.inflight_writes == 0
                    && piece.state != PieceState::Complete
                {
                    piece.state = PieceState::Unknown;
                    let expected = piece.hash;
                    let index = r.piece;
                    tokio::spawn(async move {
                        let correct = match store.hash_piece(index).await {
                            Ok(sum) => sum == expected,
                            Err(err) => {
                                warn!(piece = index, %err, "piece hash failed");
                                false
                            }
                        };
                        shared.post(move |s| s.piece_hashed(ih, index, correct));
                    });
                }
            }
        }
    }

    /// Verification verdict for one piece. Completion broadcasts Have to
    /// every connection that has not announced it; failure rebuilds the
    /// chunk set and reschedules peers that advertise the piece.
    fn piece_hashed(&mut self, ih: InfoHash, index: u32, correct: bool) {
        let cap = self.shared.config.request_cap;
        let Some(entry) = self.torrents.get_mut(&ih) else {
            return;
        };
        let t = &mut entry.torrent;
        let new_state = if correct {
            PieceState::Complete
        } else {
            PieceState::Incomplete
        };
        {
            let Some(piece) = t.pieces.get_mut(index as usize) else {
                return;
            };
            if piece.state == new_state {
                return;
            }
            piece.state = new_state;
        }
        if correct {
            t.pieces[index as usize].pending_chunks.clear();
            let ids: Vec<ConnId> = t.conns.keys().copied().collect();
            for cid in &ids {
                if let Some(conn) = t.conns.get_mut(cid) {
                    conn.send_have(index);
                }
            }
            // Completion changes availability; revisit request choices.
            for cid in ids {
                sched::update_requests(t, cid, cap);
            }
            if t.have_all_pieces() {
                info!(torrent = %ih, "all pieces complete");
            }
        } else {
            debug!(torrent = %ih, piece = index, "hash mismatch; chunks rescheduled");
            let specs = t.piece_chunk_specs(index);
            t.pieces[index as usize].pending_chunks = specs;
            let ids: Vec<ConnId> = t
                .conns
                .iter()
                .filter(|(_, c)| c.peer_has_piece(index))
                .map(|(id, _)| *id)
                .collect();
            for cid in ids {
                sched::update_requests(t, cid, cap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{
        read_handshake_peer_id, read_handshake_prefix, send_handshake,
    };
    use crate::storage::MemoryStore;
    use crate::torrent::MetaFile;
    use bytes::Bytes;
    use sha1::{Digest, Sha1};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const PIECE_LEN: u32 = 0x8000; // 32 KiB, two chunks per piece

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn test_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn test_meta(content: &[u8]) -> TorrentMeta {
        let piece_hashes = content
            .chunks(PIECE_LEN as usize)
            .map(sha1)
            .collect::<Vec<_>>();
        let mut ih = [0u8; 20];
        ih[..8].copy_from_slice(&sha1(content)[..8]);
        TorrentMeta {
            info_hash: InfoHash(ih),
            name: "swap".into(),
            piece_length: PIECE_LEN,
            total_length: content.len() as u64,
            piece_hashes,
            files: vec![MetaFile {
                path: "swap.bin".into(),
                length: content.len() as u64,
            }],
        }
    }

    fn listening_config() -> Config {
        Config {
            listen_addr: Some("127.0.0.1:0".parse().unwrap()),
            ..Config::default()
        }
    }

    fn tracker_peer(addr: SocketAddr) -> Peer {
        Peer {
            ip: addr.ip(),
            port: addr.port(),
            id: None,
            source: PeerSource::Tracker,
        }
    }

    async fn wait_for_completion(client: &Client, ih: InfoHash, pieces: usize) {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let statuses = client.torrents().await.unwrap();
                if statuses
                    .iter()
                    .any(|s| s.info_hash == ih && s.completed_pieces == pieces)
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("download completed in time");
    }

    async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Message {
        loop {
            if let Some(msg) = Message::decode_frame(buf).unwrap() {
                return msg;
            }
            let n = stream.read_buf(buf).await.unwrap();
            assert_ne!(n, 0, "peer closed the connection");
        }
    }

    async fn send_msg(stream: &mut TcpStream, msg: Message) {
        stream.write_all(&msg.encode()).await.unwrap();
    }

    /// Accepts one connection and answers the handshake without the fast
    /// extension, so choking implicitly rejects outstanding requests.
    async fn accept_non_fast(
        listener: &TcpListener,
        info_hash: [u8; 20],
    ) -> (TcpStream, BytesMut) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (_, their_hash) = read_handshake_prefix(&mut stream).await.unwrap();
        assert_eq!(their_hash, info_hash);
        let ours = Handshake {
            reserved: [0u8; 8],
            info_hash,
            peer_id: [b's'; 20],
        };
        send_handshake(&mut stream, &ours).await.unwrap();
        read_handshake_peer_id(&mut stream).await.unwrap();
        (stream, BytesMut::with_capacity(64 * 1024))
    }

    fn full_bitfield(num_pieces: usize) -> Message {
        let mut bf = crate::peer::Bitfield::new(num_pieces);
        for i in 0..num_pieces {
            bf.set(i);
        }
        Message::Bitfield(bf.to_bytes())
    }

    #[tokio::test]
    async fn two_peer_swap() {
        let content = test_content(PIECE_LEN as usize * 3);
        let meta = test_meta(&content);
        let ih = meta.info_hash;

        let seeder = Client::new(listening_config()).await.unwrap();
        let seeder_store = MemoryStore::seeded(PIECE_LEN, content.clone());
        seeder.add_torrent(meta.clone(), seeder_store).await.unwrap();
        wait_for_completion(&seeder, ih, 3).await;

        let leech = Client::new(Config::default()).await.unwrap();
        let leech_store = MemoryStore::new(PIECE_LEN, content.len() as u64);
        leech.add_torrent(meta, leech_store.clone()).await.unwrap();
        leech
            .add_peers(ih, vec![tracker_peer(seeder.local_addr().unwrap())])
            .await
            .unwrap();

        wait_for_completion(&leech, ih, 3).await;
        assert_eq!(leech_store.contents(), content);
        assert_eq!(leech.metrics().useful_chunks_received(), 6);
        assert_eq!(seeder.metrics().chunks_sent(), 6);

        leech.close().await;
        seeder.close().await;
    }

    #[tokio::test]
    async fn choke_discards_and_unchoke_replenishes() {
        let content = test_content(PIECE_LEN as usize * 3);
        let meta = test_meta(&content);
        let ih = meta.info_hash;
        let num_pieces = meta.num_pieces();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seeder_addr = listener.local_addr().unwrap();

        let leech = Client::new(Config::default()).await.unwrap();
        let leech_store = MemoryStore::new(PIECE_LEN, content.len() as u64);
        leech.add_torrent(meta, leech_store.clone()).await.unwrap();
        leech
            .add_peers(ih, vec![tracker_peer(seeder_addr)])
            .await
            .unwrap();

        let script_content = content.clone();
        let script = tokio::spawn(async move {
            let (mut stream, mut buf) = accept_non_fast(&listener, ih.0).await;
            send_msg(&mut stream, full_bitfield(num_pieces)).await;

            // The leech signals interest, and requests start once unchoked.
            loop {
                if let Message::Interested = read_frame(&mut stream, &mut buf).await {
                    break;
                }
            }
            send_msg(&mut stream, Message::Unchoke).await;

            // Collect the initial burst of requests (2 chunks x 3 pieces).
            let mut first_burst = Vec::new();
            while first_burst.len() < 6 {
                match read_frame(&mut stream, &mut buf).await {
                    Message::Request {
                        index,
                        begin,
                        length,
                    } => first_burst.push((index, begin, length)),
                    Message::KeepAlive => {}
                    other => panic!("unexpected message before choke: {other:?}"),
                }
            }

            // Serve the first piece only, then choke. The leech must treat
            // the four unserved requests as implicitly rejected.
            for &(index, begin, length) in
                first_burst.iter().filter(|(index, _, _)| *index == 0)
            {
                let at = index as usize * PIECE_LEN as usize + begin as usize;
                send_msg(
                    &mut stream,
                    Message::Piece {
                        index,
                        begin,
                        data: Bytes::copy_from_slice(
                            &script_content[at..at + length as usize],
                        ),
                    },
                )
                .await;
            }
            send_msg(&mut stream, Message::Choke).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            send_msg(&mut stream, Message::Unchoke).await;

            // After the unchoke the leech re-requests everything it is
            // still missing; serve to completion.
            let mut replenished = std::collections::HashSet::new();
            loop {
                match read_frame(&mut stream, &mut buf).await {
                    Message::Request {
                        index,
                        begin,
                        length,
                    } => {
                        replenished.insert((index, begin));
                        let at = index as usize * PIECE_LEN as usize + begin as usize;
                        send_msg(
                            &mut stream,
                            Message::Piece {
                                index,
                                begin,
                                data: Bytes::copy_from_slice(
                                    &script_content[at..at + length as usize],
                                ),
                            },
                        )
                        .await;
                    }
                    Message::Have { .. } | Message::NotInterested | Message::KeepAlive => {}
                    other => panic!("unexpected message after unchoke: {other:?}"),
                }
                if replenished.len() == 4 {
                    break;
                }
            }
            let pieces: std::collections::HashSet<u32> =
                replenished.iter().map(|(index, _)| *index).collect();
            assert_eq!(pieces, [1u32, 2].into_iter().collect());
        });

        wait_for_completion(&leech, ih, 3).await;
        assert_eq!(leech_store.contents(), content);
        script.await.unwrap();
        leech.close().await;
    }

    #[tokio::test]
    async fn tampered_piece_is_rebuilt_and_refetched() {
        let content = test_content(PIECE_LEN as usize * 3);
        let meta = test_meta(&content);
        let ih = meta.info_hash;
        let num_pieces = meta.num_pieces();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seeder_addr = listener.local_addr().unwrap();

        let leech = Client::new(Config::default()).await.unwrap();
        let leech_store = MemoryStore::new(PIECE_LEN, content.len() as u64);
        leech.add_torrent(meta, leech_store.clone()).await.unwrap();
        leech
            .add_peers(ih, vec![tracker_peer(seeder_addr)])
            .await
            .unwrap();

        let script_content = content.clone();
        let script = tokio::spawn(async move {
            let (mut stream, mut buf) = accept_non_fast(&listener, ih.0).await;
            send_msg(&mut stream, full_bitfield(num_pieces)).await;
            loop {
                if let Message::Interested = read_frame(&mut stream, &mut buf).await {
                    break;
                }
            }
            send_msg(&mut stream, Message::Unchoke).await;

            let mut serve_count: HashMap<(u32, u32), u32> = HashMap::new();
            let mut haves = Vec::new();
            loop {
                match read_frame(&mut stream, &mut buf).await {
                    Message::Request {
                        index,
                        begin,
                        length,
                    } => {
                        let at = index as usize * PIECE_LEN as usize + begin as usize;
                        let mut data =
                            script_content[at..at + length as usize].to_vec();
                        let served = serve_count.entry((index, begin)).or_insert(0);
                        // Piece 1 is delivered corrupted twice before the
                        // honest copy goes out.
                        if index == 1 && *served < 2 {
                            for byte in data.iter_mut() {
                                *byte ^= 0xFF;
                            }
                        }
                        *served += 1;
                        send_msg(
                            &mut stream,
                            Message::Piece {
                                index,
                                begin,
                                data: Bytes::from(data),
                            },
                        )
                        .await;
                    }
                    Message::Have { piece } => {
                        haves.push(piece);
                        if haves.len() == 3 {
                            break;
                        }
                    }
                    Message::Interested | Message::NotInterested | Message::KeepAlive => {}
                    other => panic!("unexpected message: {other:?}"),
                }
            }

            // Each piece announced exactly once, and piece 1 only after the
            // two corrupted rounds forced full chunk refetches.
            let mut sorted = haves.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2]);
            assert_eq!(serve_count[&(1u32, 0u32)], 3);
            assert_eq!(serve_count[&(1u32, 0x4000u32)], 3);
        });

        wait_for_completion(&leech, ih, 3).await;
        assert_eq!(leech_store.contents(), content);
        script.await.unwrap();
        leech.close().await;
    }

    #[tokio::test]
    async fn duplicate_peer_id_is_rejected() {
        let content = test_content(PIECE_LEN as usize);
        let meta = test_meta(&content);
        let ih = meta.info_hash;

        let client = Client::new(listening_config()).await.unwrap();
        let store = MemoryStore::new(PIECE_LEN, content.len() as u64);
        client.add_torrent(meta, store).await.unwrap();
        let addr = client.local_addr().unwrap();

        async fn dial(addr: SocketAddr, ih: [u8; 20], peer_id: [u8; 20]) -> TcpStream {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            peer::connect_handshake(&mut stream, ih, peer_id).await.unwrap();
            stream
        }

        let _first = dial(addr, ih.0, [b'd'; 20]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _second = dial(addr, ih.0, [b'd'; 20]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let statuses = client.torrents().await.unwrap();
        assert_eq!(statuses[0].connections, 1);
        client.close().await;
    }

    #[tokio::test]
    async fn add_torrent_twice_fails() {
        let content = test_content(PIECE_LEN as usize);
        let meta = test_meta(&content);
        let client = Client::new(Config::default()).await.unwrap();
        let store = MemoryStore::new(PIECE_LEN, content.len() as u64);

        client.add_torrent(meta.clone(), store.clone()).await.unwrap();
        assert!(matches!(
            client.add_torrent(meta, store).await,
            Err(ClientError::DuplicateTorrent)
        ));
        client.close().await;
    }

    #[tokio::test]
    async fn wait_all_returns_when_registry_empties() {
        let content = test_content(PIECE_LEN as usize);
        let meta = test_meta(&content);
        let ih = meta.info_hash;
        let client = Client::new(Config::default()).await.unwrap();
        let store = MemoryStore::new(PIECE_LEN, content.len() as u64);
        client.add_torrent(meta, store).await.unwrap();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.wait_all().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        client.remove_torrent(ih).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("wait_all unblocked")
            .unwrap();
        client.close().await;
    }
}
