//! The DHT server: UDP socket, routing table, and transaction plumbing.

use std::collections::{BinaryHeap, HashMap};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::error::DhtError;
use super::message::{Krpc, KrpcBody, Query, ResponseData};
use super::node::{CompactPeer, Distance, Node, NodeId, NodeInfo};
use crate::constants::{
    DHT_BOOTSTRAP_NODE, DHT_BOOTSTRAP_ROUND, DHT_BOOTSTRAP_TARGET, DHT_K, DHT_QUERY_TIMEOUT,
};

const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);
const MAX_ANNOUNCES_PER_HASH: usize = 1000;
/// How many closest good nodes a get_peers fan-out queries.
const GET_PEERS_FANOUT: usize = 160;

/// Server configuration. The node id is derived from the host identity
/// when not set explicitly.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub addr: SocketAddr,
    pub id: Option<NodeId>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 6881)),
            id: None,
        }
    }
}

/// Peers reported by one node during a get_peers traversal.
#[derive(Debug, Clone)]
pub struct PeerStreamValue {
    pub peers: Vec<SocketAddrV4>,
    pub from: SocketAddr,
    pub from_id: Option<NodeId>,
}

/// Stream of get_peers results. Dropping it cancels the in-flight queries.
pub struct PeerStream {
    rx: mpsc::UnboundedReceiver<PeerStreamValue>,
    _stop: watch::Sender<bool>,
}

impl PeerStream {
    /// The next batch of peers, or `None` once every queried node has
    /// answered or timed out.
    pub async fn recv(&mut self) -> Option<PeerStreamValue> {
        self.rx.recv().await
    }
}

type OnResponse = Box<dyn FnOnce(&mut Inner, &Krpc) + Send>;

struct Transaction {
    tx: mpsc::Sender<Krpc>,
    on_response: Option<OnResponse>,
}

struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }
}

struct Inner {
    /// Flat routing table keyed by remote address.
    nodes: HashMap<SocketAddr, Node>,
    /// Outstanding queries keyed by (transaction id, remote address).
    transactions: HashMap<(Bytes, SocketAddr), Transaction>,
    next_tid: u64,
    token_secrets: TokenSecrets,
    /// Peers other nodes announced to us, per infohash.
    announces: HashMap<[u8; 20], Vec<(SocketAddrV4, Instant)>>,
}

/// A BEP-5 DHT node: answers KRPC queries and issues its own to find
/// peers for infohashes.
pub struct DhtServer {
    socket: Arc<UdpSocket>,
    id: NodeId,
    local_addr: SocketAddr,
    inner: Mutex<Inner>,
    shutdown: watch::Sender<bool>,
    confirmed_announces: AtomicU64,
}

impl DhtServer {
    /// Binds the UDP socket and starts serving.
    pub async fn start(config: DhtConfig) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(config.addr).await?;
        let local_addr = socket.local_addr()?;
        let id = config.id.unwrap_or_else(|| NodeId::for_socket(&local_addr));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = Arc::new(Self {
            socket: Arc::new(socket),
            id,
            local_addr,
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                transactions: HashMap::new(),
                next_tid: 0,
                token_secrets: TokenSecrets::new(),
                announces: HashMap::new(),
            }),
            shutdown,
            confirmed_announces: AtomicU64::new(0),
        });
        info!(addr = %local_addr, id = %id, "dht server listening");
        tokio::spawn(server.clone().run(shutdown_rx));
        Ok(server)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn good_node_count(&self) -> usize {
        self.inner.lock().nodes.values().filter(|n| n.is_good()).count()
    }

    pub fn confirmed_announces(&self) -> u64 {
        self.confirmed_announces.load(Ordering::Relaxed)
    }

    /// Shuts the server down and cancels every outstanding transaction by
    /// closing its response channel.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.inner.lock().transactions.clear();
    }

    /// Registers a possible node and pings it in the background.
    pub fn add_candidate(self: &Arc<Self>, addr: SocketAddr) {
        self.inner
            .lock()
            .nodes
            .entry(addr)
            .or_insert_with(|| Node::new(addr));
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = server.ping(addr).await {
                debug!(%addr, %err, "candidate ping failed");
            }
        });
    }

    /// The k nodes passing `filter` closest to `target` by XOR distance,
    /// ascending.
    pub fn closest_nodes(
        &self,
        target: &NodeId,
        k: usize,
        filter: impl Fn(&Node) -> bool,
    ) -> Vec<Node> {
        let inner = self.inner.lock();
        closest_of(&inner, target, k, filter)
    }

    pub fn closest_good_nodes(&self, target: &NodeId, k: usize) -> Vec<Node> {
        self.closest_nodes(target, k, Node::is_good)
    }

    // --- outgoing queries ----------------------------------------------

    pub async fn ping(self: &Arc<Self>, addr: SocketAddr) -> Result<Krpc, DhtError> {
        self.send_query(addr, Query::Ping, None).await
    }

    /// Queries one node for nodes near `target`; response nodes are lifted
    /// into the routing table before the caller sees them.
    pub async fn find_node(
        self: &Arc<Self>,
        addr: SocketAddr,
        target: NodeId,
    ) -> Result<Vec<NodeInfo>, DhtError> {
        let on_response: OnResponse = Box::new(|inner, msg| lift_nodes(inner, msg));
        let msg = self
            .send_query(addr, Query::FindNode { target }, Some(on_response))
            .await?;
        Ok(msg
            .response_data()
            .map(|d| d.nodes.clone())
            .unwrap_or_default())
    }

    /// Fans a get_peers query out to the closest good nodes and streams
    /// back every non-empty `values` list as it arrives.
    pub fn get_peers(self: &Arc<Self>, info_hash: [u8; 20]) -> PeerStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let targets = self.closest_good_nodes(&NodeId(info_hash), GET_PEERS_FANOUT);
        for node in targets {
            let server = self.clone();
            let tx = tx.clone();
            let mut stop = stop_tx.subscribe();
            tokio::spawn(async move {
                let query = server.get_peers_query(node.addr, info_hash);
                tokio::select! {
                    res = query => {
                        if let Ok(msg) = res {
                            let peers = msg.peer_values();
                            if !peers.is_empty() {
                                let _ = tx.send(PeerStreamValue {
                                    peers,
                                    from: node.addr,
                                    from_id: msg.sender_id,
                                });
                            }
                        }
                    }
                    _ = stop.changed() => {}
                }
            });
        }
        PeerStream {
            rx,
            _stop: stop_tx,
        }
    }

    async fn get_peers_query(
        self: &Arc<Self>,
        addr: SocketAddr,
        info_hash: [u8; 20],
    ) -> Result<Krpc, DhtError> {
        // Besides the caller's peers, the response carries closer nodes and
        // the announce token this node will expect from us later.
        let on_response: OnResponse = Box::new(move |inner, msg| {
            lift_nodes(inner, msg);
            if let Some(token) = msg.response_data().and_then(|d| d.token.clone()) {
                if let Some(node) = inner.nodes.get_mut(&addr) {
                    node.announce_token = Some(token);
                }
            }
        });
        self.send_query(addr, Query::GetPeers { info_hash }, Some(on_response))
            .await
    }

    /// Announces our listen port to every good node that has given us a
    /// token. Nodes without one are skipped silently. Returns how many
    /// queries went out.
    pub async fn announce_peer(
        self: &Arc<Self>,
        port: u16,
        info_hash: [u8; 20],
        implied_port: bool,
    ) -> Result<usize, DhtError> {
        let targets: Vec<(SocketAddr, Bytes)> = {
            let inner = self.inner.lock();
            closest_of(&inner, &NodeId(info_hash), GET_PEERS_FANOUT, |n| {
                n.is_good() && n.announce_token.is_some()
            })
            .into_iter()
            .filter_map(|n| n.announce_token.clone().map(|t| (n.addr, t)))
            .collect()
        };
        let sent = targets.len();
        for (addr, token) in targets {
            let server = self.clone();
            let query = Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            };
            tokio::spawn(async move {
                match server.send_query(addr, query, None).await {
                    Ok(msg) if !msg.is_error() => {
                        server.confirmed_announces.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(err) => debug!(%addr, %err, "announce_peer failed"),
                }
            });
        }
        Ok(sent)
    }

    /// Populates the routing table: seeds a well-known node when empty,
    /// then repeats `find_node(self)` rounds against every known node
    /// until enough good nodes are known or a round makes no progress.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<(), DhtError> {
        if self.inner.lock().nodes.is_empty() {
            match tokio::net::lookup_host(DHT_BOOTSTRAP_NODE).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        self.inner
                            .lock()
                            .nodes
                            .entry(addr)
                            .or_insert_with(|| Node::new(addr));
                    }
                }
                Err(err) => warn!(%err, "failed to resolve bootstrap node"),
            }
        }
        loop {
            if *self.shutdown.borrow() {
                return Err(DhtError::Closed);
            }
            let targets: Vec<SocketAddr> = self.inner.lock().nodes.keys().copied().collect();
            if targets.is_empty() {
                return Ok(());
            }
            let before = targets.len();
            let queries = targets
                .into_iter()
                .map(|addr| {
                    let server = self.clone();
                    async move {
                        let _ = server.find_node(addr, server.id).await;
                    }
                })
                .collect::<Vec<_>>();
            let _ = tokio::time::timeout(
                DHT_BOOTSTRAP_ROUND,
                futures::future::join_all(queries),
            )
            .await;
            let (good, total) = {
                let inner = self.inner.lock();
                (
                    inner.nodes.values().filter(|n| n.is_good()).count(),
                    inner.nodes.len(),
                )
            };
            debug!(good, total, "bootstrap round finished");
            if good >= DHT_BOOTSTRAP_TARGET || total <= before {
                return Ok(());
            }
        }
    }

    async fn send_query(
        self: &Arc<Self>,
        addr: SocketAddr,
        query: Query,
        on_response: Option<OnResponse>,
    ) -> Result<Krpc, DhtError> {
        if *self.shutdown.borrow() {
            return Err(DhtError::Closed);
        }
        let (tx, mut rx) = mpsc::channel(1);
        let (tid, payload) = {
            let mut inner = self.inner.lock();
            let tid = varint(inner.next_tid);
            inner.next_tid += 1;
            inner.transactions.insert(
                (tid.clone(), addr),
                Transaction { tx, on_response },
            );
            let msg = Krpc::query(tid.clone(), self.id, query);
            (tid, msg.encode())
        };
        if let Err(err) = self.socket.send_to(&payload, addr).await {
            self.inner.lock().transactions.remove(&(tid, addr));
            return Err(err.into());
        }
        self.mark_sent(addr);

        // The timeout owns removal; dropping the sender closes the channel.
        let server = self.clone();
        let timeout_tid = tid.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DHT_QUERY_TIMEOUT).await;
            server
                .inner
                .lock()
                .transactions
                .remove(&(timeout_tid, addr));
        });

        match rx.recv().await {
            Some(msg) => {
                if let KrpcBody::Error { code, message } = &msg.body {
                    return Err(DhtError::Remote {
                        code: *code,
                        message: message.clone(),
                    });
                }
                Ok(msg)
            }
            None => Err(DhtError::Timeout),
        }
    }

    // --- incoming packets ----------------------------------------------

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 0x10000];
        let mut rotate = tokio::time::interval(TOKEN_ROTATE_INTERVAL);
        rotate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        rotate.tick().await;
        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, addr)) => self.handle_packet(&buf[..n], addr).await,
                    Err(err) => {
                        warn!(%err, "dht socket read failed");
                    }
                },
                _ = rotate.tick() => {
                    self.inner.lock().token_secrets.rotate();
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn handle_packet(&self, data: &[u8], addr: SocketAddr) {
        let msg = match Krpc::parse(data) {
            Ok(msg) => msg,
            Err(err) => {
                // Malformed packets are dropped with no further effect.
                debug!(%addr, %err, "dropping bad krpc packet");
                return;
            }
        };
        match &msg.body {
            KrpcBody::Query(query) => {
                self.heard_from(addr, msg.sender_id);
                let reply = self.handle_query(&msg.transaction_id, addr, query);
                if let Some(reply) = reply {
                    if let Err(err) = self.socket.send_to(&reply, addr).await {
                        debug!(%addr, %err, "failed to send krpc reply");
                    } else {
                        self.mark_sent(addr);
                    }
                }
            }
            KrpcBody::Response(_) | KrpcBody::Error { .. } => {
                let transaction = {
                    let mut inner = self.inner.lock();
                    let mut transaction = inner
                        .transactions
                        .remove(&(msg.transaction_id.clone(), addr));
                    if let Some(t) = transaction.as_mut() {
                        // Hooks run under the lock: node lifting and token
                        // capture land atomically with the table update.
                        if let Some(hook) = t.on_response.take() {
                            hook(&mut inner, &msg);
                        }
                    }
                    transaction
                };
                let Some(transaction) = transaction else {
                    debug!(%addr, "dropping unmatched krpc response");
                    return;
                };
                self.heard_from(addr, msg.sender_id);
                let _ = transaction.tx.try_send(msg);
            }
        }
    }

    fn handle_query(&self, tid: &Bytes, addr: SocketAddr, query: &Query) -> Option<Vec<u8>> {
        let reply = match query {
            Query::Ping => Krpc::response(tid.clone(), self.id, ResponseData::default()),
            Query::FindNode { target } => {
                let nodes = self.compact_closest(target);
                Krpc::response(
                    tid.clone(),
                    self.id,
                    ResponseData {
                        nodes,
                        ..Default::default()
                    },
                )
            }
            Query::GetPeers { info_hash } => {
                let nodes = self.compact_closest(&NodeId(*info_hash));
                let (token, values) = {
                    let mut inner = self.inner.lock();
                    let token = make_token(&inner.token_secrets.current, &addr);
                    let values = stored_peers(&mut inner, info_hash);
                    (token, values)
                };
                Krpc::response(
                    tid.clone(),
                    self.id,
                    ResponseData {
                        nodes,
                        values,
                        token: Some(token),
                    },
                )
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                let mut inner = self.inner.lock();
                if !token_valid(&inner.token_secrets, &addr, token) {
                    debug!(%addr, "rejecting announce_peer with bad token");
                    Krpc::error(tid.clone(), 203, "invalid token")
                } else {
                    let peer_port = if *implied_port { addr.port() } else { *port };
                    if let IpAddr::V4(ip) = addr.ip() {
                        record_announce(
                            &mut inner,
                            *info_hash,
                            SocketAddrV4::new(ip, peer_port),
                        );
                    }
                    Krpc::response(tid.clone(), self.id, ResponseData::default())
                }
            }
        };
        Some(reply.encode())
    }

    fn compact_closest(&self, target: &NodeId) -> Vec<NodeInfo> {
        let inner = self.inner.lock();
        closest_of(&inner, target, DHT_K, Node::is_good)
            .iter()
            .filter_map(Node::info)
            .collect()
    }

    fn heard_from(&self, addr: SocketAddr, id: Option<NodeId>) {
        let mut inner = self.inner.lock();
        let node = inner.nodes.entry(addr).or_insert_with(|| Node::new(addr));
        if id.is_some() {
            node.id = id;
        }
        node.last_heard_from = Some(Instant::now());
    }

    fn mark_sent(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        let node = inner.nodes.entry(addr).or_insert_with(|| Node::new(addr));
        node.last_sent_to = Some(Instant::now());
    }
}

/// Scrapes response `nodes` into the routing table.
fn lift_nodes(inner: &mut Inner, msg: &Krpc) {
    let Some(data) = msg.response_data() else {
        return;
    };
    for info in &data.nodes {
        if info.addr.port() == 0 {
            continue;
        }
        let addr = SocketAddr::V4(info.addr);
        let node = inner.nodes.entry(addr).or_insert_with(|| Node::new(addr));
        if node.id.is_none() {
            node.id = Some(info.id);
        }
    }
}

/// Bounded-heap selection of the k closest nodes by full XOR distance.
fn closest_of(
    inner: &Inner,
    target: &NodeId,
    k: usize,
    filter: impl Fn(&Node) -> bool,
) -> Vec<Node> {
    let mut heap: BinaryHeap<(Distance, SocketAddr)> = BinaryHeap::new();
    for (addr, node) in &inner.nodes {
        if !filter(node) {
            continue;
        }
        let Some(id) = node.id else {
            continue;
        };
        heap.push((id.distance(target), *addr));
        if heap.len() > k {
            heap.pop();
        }
    }
    let mut picked = heap.into_vec();
    picked.sort();
    picked
        .into_iter()
        .filter_map(|(_, addr)| inner.nodes.get(&addr).cloned())
        .collect()
}

fn make_token(secret: &[u8; 16], addr: &SocketAddr) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    hasher.update(addr.ip().to_string().as_bytes());
    Bytes::copy_from_slice(&hasher.finalize()[..8])
}

fn token_valid(secrets: &TokenSecrets, addr: &SocketAddr, token: &Bytes) -> bool {
    make_token(&secrets.current, addr) == *token || make_token(&secrets.previous, addr) == *token
}

fn stored_peers(inner: &mut Inner, info_hash: &[u8; 20]) -> Vec<CompactPeer> {
    let Some(peers) = inner.announces.get_mut(info_hash) else {
        return Vec::new();
    };
    let now = Instant::now();
    peers.retain(|(_, at)| now.duration_since(*at) < ANNOUNCE_LIFETIME);
    peers.iter().map(|(addr, _)| CompactPeer(*addr)).collect()
}

fn record_announce(inner: &mut Inner, info_hash: [u8; 20], peer: SocketAddrV4) {
    let peers = inner.announces.entry(info_hash).or_default();
    let now = Instant::now();
    peers.retain(|(addr, at)| *addr != peer && now.duration_since(*at) < ANNOUNCE_LIFETIME);
    if peers.len() < MAX_ANNOUNCES_PER_HASH {
        peers.push((peer, now));
    }
}

/// Unsigned LEB128, the varint flavor used for transaction ids.
fn varint(mut v: u64) -> Bytes {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
    out.into()
}
