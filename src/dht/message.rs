//! KRPC message codec.
//!
//! A KRPC packet is one bencoded dict with a transaction id `t`, a type
//! `y` of `"q"`, `"r"` or `"e"`, and the query arguments, response dict,
//! or `[code, message]` error list that goes with it.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;

use bytes::Bytes;

use super::error::DhtError;
use super::node::{CompactPeer, NodeId, NodeInfo};
use crate::bencode::{decode, encode, Value};

/// An outgoing or incoming query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        info_hash: [u8; 20],
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

impl Query {
    fn name(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// The useful parts of a response dict. KRPC responses are shapeless, so
/// every field is optional and the caller takes what its query expects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseData {
    pub nodes: Vec<NodeInfo>,
    pub values: Vec<CompactPeer>,
    pub token: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcBody {
    Query(Query),
    Response(ResponseData),
    Error { code: i64, message: String },
}

/// One KRPC packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Krpc {
    pub transaction_id: Bytes,
    /// The sender's node id; absent on errors.
    pub sender_id: Option<NodeId>,
    pub body: KrpcBody,
}

impl Krpc {
    pub fn query(transaction_id: Bytes, sender: NodeId, query: Query) -> Self {
        Self {
            transaction_id,
            sender_id: Some(sender),
            body: KrpcBody::Query(query),
        }
    }

    pub fn response(transaction_id: Bytes, sender: NodeId, data: ResponseData) -> Self {
        Self {
            transaction_id,
            sender_id: Some(sender),
            body: KrpcBody::Response(data),
        }
    }

    pub fn error(transaction_id: Bytes, code: i64, message: &str) -> Self {
        Self {
            transaction_id,
            sender_id: None,
            body: KrpcBody::Error {
                code,
                message: message.to_string(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, KrpcBody::Error { .. })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"t"),
            Value::Bytes(self.transaction_id.clone()),
        );
        match &self.body {
            KrpcBody::Query(query) => {
                dict.insert(Bytes::from_static(b"y"), Value::str("q"));
                dict.insert(Bytes::from_static(b"q"), Value::str(query.name()));
                dict.insert(
                    Bytes::from_static(b"a"),
                    Value::Dict(self.encode_args(query)),
                );
            }
            KrpcBody::Response(data) => {
                dict.insert(Bytes::from_static(b"y"), Value::str("r"));
                dict.insert(
                    Bytes::from_static(b"r"),
                    Value::Dict(self.encode_response(data)),
                );
            }
            KrpcBody::Error { code, message } => {
                dict.insert(Bytes::from_static(b"y"), Value::str("e"));
                dict.insert(
                    Bytes::from_static(b"e"),
                    Value::List(vec![Value::Int(*code), Value::str(message)]),
                );
            }
        }
        encode(&Value::Dict(dict))
    }

    fn encode_args(&self, query: &Query) -> BTreeMap<Bytes, Value> {
        let mut args = BTreeMap::new();
        if let Some(id) = &self.sender_id {
            args.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
        }
        match query {
            Query::Ping => {}
            Query::FindNode { target } => {
                args.insert(
                    Bytes::from_static(b"target"),
                    Value::bytes(target.as_bytes()),
                );
            }
            Query::GetPeers { info_hash } => {
                args.insert(Bytes::from_static(b"info_hash"), Value::bytes(info_hash));
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                args.insert(Bytes::from_static(b"info_hash"), Value::bytes(info_hash));
                args.insert(Bytes::from_static(b"port"), Value::Int(*port as i64));
                args.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                args.insert(
                    Bytes::from_static(b"implied_port"),
                    Value::Int(i64::from(*implied_port)),
                );
            }
        }
        args
    }

    fn encode_response(&self, data: &ResponseData) -> BTreeMap<Bytes, Value> {
        let mut resp = BTreeMap::new();
        if let Some(id) = &self.sender_id {
            resp.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
        }
        if !data.nodes.is_empty() {
            let mut compact = Vec::with_capacity(data.nodes.len() * 26);
            for node in &data.nodes {
                compact.extend_from_slice(&node.to_compact());
            }
            resp.insert(Bytes::from_static(b"nodes"), Value::Bytes(compact.into()));
        }
        if !data.values.is_empty() {
            let values = data
                .values
                .iter()
                .map(|peer| Value::bytes(&peer.to_bytes()))
                .collect();
            resp.insert(Bytes::from_static(b"values"), Value::List(values));
        }
        if let Some(token) = &data.token {
            resp.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
        }
        resp
    }

    /// Parses a datagram. Anything that does not decode to the KRPC shape
    /// is an error the caller drops on the floor.
    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        let transaction_id = value
            .get(b"t")
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or(DhtError::Malformed("missing transaction id"))?;
        let kind = value
            .get(b"y")
            .and_then(Value::as_str)
            .ok_or(DhtError::Malformed("missing message type"))?;

        match kind {
            "q" => Self::parse_query(transaction_id, &value),
            "r" => Self::parse_response(transaction_id, &value),
            "e" => {
                let list = value
                    .get(b"e")
                    .and_then(Value::as_list)
                    .ok_or(DhtError::Malformed("missing error list"))?;
                let code = list.first().and_then(Value::as_int).unwrap_or(0);
                let message = list
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                Ok(Self {
                    transaction_id,
                    sender_id: None,
                    body: KrpcBody::Error { code, message },
                })
            }
            _ => Err(DhtError::Malformed("unknown message type")),
        }
    }

    fn parse_query(transaction_id: Bytes, value: &Value) -> Result<Self, DhtError> {
        let name = value
            .get(b"q")
            .and_then(Value::as_str)
            .ok_or(DhtError::Malformed("missing query name"))?;
        let args = value
            .get(b"a")
            .and_then(Value::as_dict)
            .ok_or(DhtError::Malformed("missing query args"))?;
        let sender_id = args
            .get(b"id".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| NodeId::from_bytes(b));

        let info_hash = |key: &'static str| -> Result<[u8; 20], DhtError> {
            args.get(key.as_bytes())
                .and_then(Value::as_bytes)
                .and_then(|b| <[u8; 20]>::try_from(b.as_ref()).ok())
                .ok_or(DhtError::Malformed("bad or missing 20-byte id"))
        };

        let query = match name {
            "ping" => Query::Ping,
            "find_node" => Query::FindNode {
                target: NodeId(info_hash("target")?),
            },
            "get_peers" => Query::GetPeers {
                info_hash: info_hash("info_hash")?,
            },
            "announce_peer" => Query::AnnouncePeer {
                info_hash: info_hash("info_hash")?,
                port: args
                    .get(b"port".as_slice())
                    .and_then(Value::as_int)
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or(DhtError::Malformed("bad or missing port"))?,
                token: args
                    .get(b"token".as_slice())
                    .and_then(Value::as_bytes)
                    .cloned()
                    .ok_or(DhtError::Malformed("missing token"))?,
                implied_port: args
                    .get(b"implied_port".as_slice())
                    .and_then(Value::as_int)
                    == Some(1),
            },
            _ => return Err(DhtError::Malformed("unknown query")),
        };

        Ok(Self {
            transaction_id,
            sender_id,
            body: KrpcBody::Query(query),
        })
    }

    fn parse_response(transaction_id: Bytes, value: &Value) -> Result<Self, DhtError> {
        let resp = value
            .get(b"r")
            .and_then(Value::as_dict)
            .ok_or(DhtError::Malformed("missing response dict"))?;
        let sender_id = resp
            .get(b"id".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| NodeId::from_bytes(b))
            .ok_or(DhtError::Malformed("missing responder id"))?;

        let nodes = resp
            .get(b"nodes".as_slice())
            .and_then(Value::as_bytes)
            .map(|b| NodeInfo::parse_list(b))
            .unwrap_or_default();
        let values = resp
            .get(b"values".as_slice())
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_bytes)
                    .filter_map(|b| CompactPeer::from_bytes(b))
                    .collect()
            })
            .unwrap_or_default();
        let token = resp.get(b"token".as_slice()).and_then(Value::as_bytes).cloned();

        Ok(Self {
            transaction_id,
            sender_id: Some(sender_id),
            body: KrpcBody::Response(ResponseData {
                nodes,
                values,
                token,
            }),
        })
    }

    /// The response payload, when this packet is a response.
    pub fn response_data(&self) -> Option<&ResponseData> {
        match &self.body {
            KrpcBody::Response(data) => Some(data),
            _ => None,
        }
    }

    /// Peers listed in a get_peers response.
    pub fn peer_values(&self) -> Vec<SocketAddrV4> {
        self.response_data()
            .map(|d| d.values.iter().map(|p| p.0).collect())
            .unwrap_or_default()
    }
}
