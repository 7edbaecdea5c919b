//! Wire codec: the 68-byte handshake and length-prefixed protocol messages.
//!
//! Stateless. Frame decoding is incremental over a [`BytesMut`] read buffer
//! so the reader loop never copies payloads twice; `Piece` and `Bitfield`
//! payloads are `Bytes` slices of the frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::PeerError;
use crate::constants::MAX_FRAME_LEN;

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Length of the fixed handshake.
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved-byte flag for the extension protocol (byte 5).
const RESERVED_EXTENSION: u8 = 0x10;
/// Reserved-byte flag for the fast extension (byte 7).
const RESERVED_FAST: u8 = 0x04;

/// The fixed handshake exchanged before any messages.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// A handshake advertising the extension protocol and fast extension.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= RESERVED_EXTENSION;
        reserved[7] |= RESERVED_FAST;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & RESERVED_FAST != 0
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & RESERVED_EXTENSION != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }
}

/// Sends our half of the handshake.
pub async fn send_handshake<W>(writer: &mut W, handshake: &Handshake) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&handshake.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the protocol prefix, reserved bytes and info hash (48 bytes).
///
/// A responder stops here: it does not know which torrent the remote wants
/// until the info hash arrives, so it withholds its own handshake until then.
pub async fn read_handshake_prefix<R>(reader: &mut R) -> Result<([u8; 8], [u8; 20]), PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 48];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|_| PeerError::BadHandshake)?;
    if prefix[0] != 19 || &prefix[1..20] != PROTOCOL {
        return Err(PeerError::BadHandshake);
    }
    let mut reserved = [0u8; 8];
    reserved.copy_from_slice(&prefix[20..28]);
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&prefix[28..48]);
    Ok((reserved, info_hash))
}

/// Reads the trailing 20-byte peer id of the remote handshake.
pub async fn read_handshake_peer_id<R>(reader: &mut R) -> Result<[u8; 20], PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut peer_id = [0u8; 20];
    reader
        .read_exact(&mut peer_id)
        .await
        .map_err(|_| PeerError::BadHandshake)?;
    Ok(peer_id)
}

/// Initiator handshake: send ours, read theirs, insist on the same torrent.
pub async fn connect_handshake<S>(
    stream: &mut S,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(info_hash, peer_id);
    send_handshake(stream, &ours).await?;
    let (reserved, their_hash) = read_handshake_prefix(stream).await?;
    if their_hash != info_hash {
        return Err(PeerError::InfoHashMismatch);
    }
    let their_id = read_handshake_peer_id(stream).await?;
    Ok(Handshake {
        reserved,
        info_hash: their_hash,
        peer_id: their_id,
    })
}

/// Message type byte following the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, PeerError> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            13 => MessageId::Suggest,
            14 => MessageId::HaveAll,
            15 => MessageId::HaveNone,
            16 => MessageId::Reject,
            17 => MessageId::AllowedFast,
            20 => MessageId::Extended,
            other => return Err(PeerError::UnknownMessageId(other)),
        })
    }
}

/// A decoded peer-wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// True for the message types introduced by the fast extension, which
    /// are only legal once both handshakes advertised it.
    pub fn requires_fast(&self) -> bool {
        matches!(
            self,
            Message::Suggest { .. }
                | Message::HaveAll
                | Message::HaveNone
                | Message::Reject { .. }
                | Message::AllowedFast { .. }
        )
    }

    /// Encodes the message with its 4-byte length prefix.
    pub fn encode(&self) -> Bytes {
        fn simple(buf: &mut BytesMut, id: MessageId) {
            buf.put_u32(1);
            buf.put_u8(id as u8);
        }
        fn with_piece(buf: &mut BytesMut, id: MessageId, piece: u32) {
            buf.put_u32(5);
            buf.put_u8(id as u8);
            buf.put_u32(piece);
        }
        fn with_spec(buf: &mut BytesMut, id: MessageId, index: u32, begin: u32, length: u32) {
            buf.put_u32(13);
            buf.put_u8(id as u8);
            buf.put_u32(index);
            buf.put_u32(begin);
            buf.put_u32(length);
        }

        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => simple(&mut buf, MessageId::Choke),
            Message::Unchoke => simple(&mut buf, MessageId::Unchoke),
            Message::Interested => simple(&mut buf, MessageId::Interested),
            Message::NotInterested => simple(&mut buf, MessageId::NotInterested),
            Message::Have { piece } => with_piece(&mut buf, MessageId::Have, *piece),
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => with_spec(&mut buf, MessageId::Request, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => with_spec(&mut buf, MessageId::Cancel, *index, *begin, *length),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::Suggest { piece } => with_piece(&mut buf, MessageId::Suggest, *piece),
            Message::HaveAll => simple(&mut buf, MessageId::HaveAll),
            Message::HaveNone => simple(&mut buf, MessageId::HaveNone),
            Message::Reject {
                index,
                begin,
                length,
            } => with_spec(&mut buf, MessageId::Reject, *index, *begin, *length),
            Message::AllowedFast { piece } => {
                with_piece(&mut buf, MessageId::AllowedFast, *piece)
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    /// Pops one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The frame cap is
    /// checked as soon as the length prefix is visible, before buffering
    /// the payload.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Message>, PeerError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(PeerError::BadFrame(length));
        }
        if buf.len() < 4 + length {
            return Ok(None);
        }
        buf.advance(4);
        if length == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let mut payload = buf.split_to(length).freeze();
        let id = MessageId::try_from(payload.get_u8())?;
        Self::parse_payload(id, payload).map(Some)
    }

    fn parse_payload(id: MessageId, mut payload: Bytes) -> Result<Message, PeerError> {
        fn need(payload: &Bytes, n: usize, what: &'static str) -> Result<(), PeerError> {
            if payload.remaining() < n {
                Err(PeerError::Truncated(what))
            } else {
                Ok(())
            }
        }

        Ok(match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                need(&payload, 4, "have")?;
                Message::Have {
                    piece: payload.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield(payload),
            MessageId::Request => {
                need(&payload, 12, "request")?;
                Message::Request {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::Piece => {
                need(&payload, 8, "piece")?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: payload,
                }
            }
            MessageId::Cancel => {
                need(&payload, 12, "cancel")?;
                Message::Cancel {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::Port => {
                need(&payload, 2, "port")?;
                Message::Port(payload.get_u16())
            }
            MessageId::Suggest => {
                need(&payload, 4, "suggest")?;
                Message::Suggest {
                    piece: payload.get_u32(),
                }
            }
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Reject => {
                need(&payload, 12, "reject")?;
                Message::Reject {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::AllowedFast => {
                need(&payload, 4, "allowed fast")?;
                Message::AllowedFast {
                    piece: payload.get_u32(),
                }
            }
            MessageId::Extended => {
                need(&payload, 1, "extended")?;
                let ext_id = payload.get_u8();
                Message::Extended {
                    id: ext_id,
                    payload,
                }
            }
        })
    }
}
