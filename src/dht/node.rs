//! Node identities, the XOR metric, and compact encodings.

use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::time::Instant;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::constants::DHT_GOOD_WINDOW;

/// 160-bit DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Derives a stable identity from the host name and bound address.
    pub fn for_socket(local: &SocketAddr) -> Self {
        let mut hasher = Sha1::new();
        if let Some(host) = std::env::var_os("HOSTNAME") {
            hasher.update(host.as_encoded_bytes());
        }
        hasher.update(local.to_string().as_bytes());
        Self(hasher.finalize().into())
    }

    /// XOR distance to `other`. Ordering uses the full 160-bit value;
    /// popcount alone ties far too often to rank nodes.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A 160-bit XOR distance, ordered big-endian.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; 20]);

impl Distance {
    pub fn bit_count(&self) -> u32 {
        self.0.iter().map(|b| b.count_ones()).sum()
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Identity and address pair used in compact node lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

/// Length of one compact node-info entry: id, IPv4, port.
pub const COMPACT_NODE_LEN: usize = 26;

impl NodeInfo {
    pub fn to_compact(&self) -> [u8; COMPACT_NODE_LEN] {
        let mut out = [0u8; COMPACT_NODE_LEN];
        out[..20].copy_from_slice(&self.id.0);
        out[20..24].copy_from_slice(&self.addr.ip().octets());
        out[24..26].copy_from_slice(&self.addr.port().to_be_bytes());
        out
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }
        let id = NodeId::from_bytes(&data[..20])?;
        let ip = std::net::Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);
        Some(Self {
            id,
            addr: SocketAddrV4::new(ip, port),
        })
    }

    /// Parses a concatenated compact node list, skipping odd-sized tails.
    pub fn parse_list(data: &[u8]) -> Vec<NodeInfo> {
        data.chunks_exact(COMPACT_NODE_LEN)
            .filter_map(Self::from_compact)
            .collect()
    }
}

/// 6-byte compact peer encoding used in `values` lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactPeer(pub SocketAddrV4);

impl CompactPeer {
    pub fn to_bytes(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&self.0.ip().octets());
        out[4..6].copy_from_slice(&self.0.port().to_be_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != 6 {
            return None;
        }
        let ip = std::net::Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let port = u16::from_be_bytes([data[4], data[5]]);
        Some(Self(SocketAddrV4::new(ip, port)))
    }
}

/// A known node in the routing table.
#[derive(Debug, Clone)]
pub struct Node {
    pub addr: SocketAddr,
    /// Unknown until the node speaks KRPC to us.
    pub id: Option<NodeId>,
    pub last_heard_from: Option<Instant>,
    pub last_sent_to: Option<Instant>,
    /// Token from its last get_peers response, required to announce to it.
    pub announce_token: Option<Bytes>,
}

impl Node {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            id: None,
            last_heard_from: None,
            last_sent_to: None,
            announce_token: None,
        }
    }

    /// A node is good when its id is known and it has answered at least as
    /// recently as we last queried it, or very recently in absolute terms.
    pub fn is_good(&self) -> bool {
        if self.id.is_none() {
            return false;
        }
        match (self.last_sent_to, self.last_heard_from) {
            (None, _) => true,
            (Some(sent), Some(heard)) if sent <= heard => true,
            (Some(_), Some(heard)) => heard.elapsed() < DHT_GOOD_WINDOW,
            (Some(_), None) => false,
        }
    }

    /// The info pair, when the id is known and the address is IPv4.
    pub fn info(&self) -> Option<NodeInfo> {
        let id = self.id?;
        match self.addr.ip() {
            IpAddr::V4(ip) => Some(NodeInfo {
                id,
                addr: SocketAddrV4::new(ip, self.addr.port()),
            }),
            IpAddr::V6(_) => None,
        }
    }
}
