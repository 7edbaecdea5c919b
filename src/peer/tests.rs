use super::*;
use crate::metrics::Metrics;
use crate::torrent::{PeerSource, Request};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn test_outbox() -> (Outbox, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    (Outbox::new(metrics.clone()), metrics)
}

fn test_conn_with_outbox(num_pieces: usize, fast: bool) -> (Conn, Outbox) {
    let (outbox, _) = test_outbox();
    let (closed_tx, _closed_rx) = watch::channel(false);
    let conn = Conn::new(
        ConnId(1),
        ([127, 0, 0, 1], 6881).into(),
        PeerSource::Tracker,
        PeerId([b'x'; 20]),
        [0u8; 8],
        fast,
        num_pieces,
        outbox.clone(),
        closed_tx,
    );
    (conn, outbox)
}

fn test_conn(num_pieces: usize, fast: bool) -> Conn {
    test_conn_with_outbox(num_pieces, fast).0
}

#[test]
fn peer_id_generate_has_client_prefix() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(&id1.0[..8], b"-GT0000-");
    assert_eq!(id1.client_tag(), Some("GT0000"));
}

#[test]
fn bitfield_set_and_count() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has(0));
    bf.set(0);
    bf.set(99);
    assert!(bf.has(0));
    assert!(bf.has(99));
    assert!(!bf.has(100));
    assert_eq!(bf.count(), 2);
}

#[test]
fn bitfield_wire_layout_is_high_bit_first() {
    let mut bf = Bitfield::new(16);
    bf.set(0);
    bf.set(9);
    assert_eq!(bf.to_bytes().as_ref(), &[0x80, 0x40]);

    let parsed = Bitfield::from_bytes(&[0x80, 0x40], 16);
    assert!(parsed.has(0));
    assert!(parsed.has(9));
    assert_eq!(parsed.count(), 2);
}

#[test]
fn bitfield_truncates_spare_bits() {
    // 10 pieces: 6 spare bits in the second byte must read as zero.
    let parsed = Bitfield::from_bytes(&[0xFF, 0xFF], 10);
    assert_eq!(parsed.count(), 10);
    assert_eq!(parsed.to_bytes().as_ref(), &[0xFF, 0xC0]);
}

#[test]
fn handshake_encodes_68_bytes() {
    let hs = Handshake::new([1u8; 20], [2u8; 20]);
    let encoded = hs.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);
    assert_eq!(encoded[0], 19);
    assert_eq!(&encoded[1..20], PROTOCOL);
    assert!(hs.supports_fast());
    assert!(hs.supports_extension_protocol());
}

#[test]
fn message_round_trips() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA0])),
        Message::Request {
            index: 1,
            begin: 0x4000,
            length: 0x4000,
        },
        Message::Piece {
            index: 3,
            begin: 0,
            data: Bytes::from_static(b"chunk bytes"),
        },
        Message::Cancel {
            index: 1,
            begin: 0x4000,
            length: 0x4000,
        },
        Message::Port(6881),
        Message::Suggest { piece: 7 },
        Message::HaveAll,
        Message::HaveNone,
        Message::Reject {
            index: 2,
            begin: 0,
            length: 0x4000,
        },
        Message::AllowedFast { piece: 5 },
        Message::Extended {
            id: 1,
            payload: Bytes::from_static(b"d1:md1:a1:bee"),
        },
    ];
    for msg in messages {
        let encoded = msg.encode();
        let payload_len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert_eq!(encoded.len(), 4 + payload_len);

        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = Message::decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }
}

#[test]
fn decode_waits_for_full_frame() {
    let encoded = Message::Have { piece: 9 }.encode();
    let mut buf = BytesMut::from(&encoded[..3]);
    assert_eq!(Message::decode_frame(&mut buf).unwrap(), None);
    buf.extend_from_slice(&encoded[3..6]);
    assert_eq!(Message::decode_frame(&mut buf).unwrap(), None);
    buf.extend_from_slice(&encoded[6..]);
    assert_eq!(
        Message::decode_frame(&mut buf).unwrap(),
        Some(Message::Have { piece: 9 })
    );
}

#[test]
fn decode_rejects_oversized_frame() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&(1024u32 * 1024).to_be_bytes());
    assert!(matches!(
        Message::decode_frame(&mut buf),
        Err(PeerError::BadFrame(_))
    ));
}

#[test]
fn decode_rejects_unknown_id() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(&[11]);
    assert!(matches!(
        Message::decode_frame(&mut buf),
        Err(PeerError::UnknownMessageId(11))
    ));
}

#[tokio::test]
async fn handshake_round_trip_over_pipe() {
    let (mut initiator, mut responder) = tokio::io::duplex(256);
    let info_hash = [7u8; 20];
    let initiator_id = [1u8; 20];
    let responder_id = [2u8; 20];

    let initiate = tokio::spawn(async move {
        connect_handshake(&mut initiator, info_hash, initiator_id)
            .await
            .unwrap()
    });

    let (reserved, their_hash) = read_handshake_prefix(&mut responder).await.unwrap();
    assert_eq!(their_hash, info_hash);
    let ours = Handshake::new(info_hash, responder_id);
    send_handshake(&mut responder, &ours).await.unwrap();
    let their_id = read_handshake_peer_id(&mut responder).await.unwrap();

    let remote = initiate.await.unwrap();
    assert_eq!(remote.peer_id, responder_id);
    assert_eq!(their_id, initiator_id);
    assert!(Handshake {
        reserved,
        info_hash: their_hash,
        peer_id: their_id
    }
    .supports_fast());
}

#[tokio::test]
async fn handshake_rejects_wrong_protocol() {
    let (mut initiator, mut responder) = tokio::io::duplex(256);
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let mut junk = [b'X'; 68];
        junk[0] = 19;
        let _ = responder.write_all(&junk).await;
    });
    let result = connect_handshake(&mut initiator, [0u8; 20], [0u8; 20]).await;
    assert!(matches!(result, Err(PeerError::BadHandshake)));
}

#[test]
fn cancel_coalesces_with_queued_request() {
    let (outbox, metrics) = test_outbox();
    outbox.post(Message::Request {
        index: 1,
        begin: 0,
        length: 0x4000,
    });
    outbox.post(Message::Cancel {
        index: 1,
        begin: 0,
        length: 0x4000,
    });
    // The socket sees neither message.
    assert!(outbox.is_empty());
    assert_eq!(metrics.optimized_cancels(), 1);
}

#[test]
fn cancel_without_queued_request_passes_through() {
    let (outbox, metrics) = test_outbox();
    outbox.post(Message::Cancel {
        index: 1,
        begin: 0,
        length: 0x4000,
    });
    assert_eq!(outbox.len(), 1);
    assert_eq!(metrics.optimized_cancels(), 0);
}

#[tokio::test(start_paused = true)]
async fn writer_posts_keepalive_when_idle() {
    let metrics = Arc::new(Metrics::new());
    let outbox = Outbox::new(metrics.clone());
    let (closed_tx, closed_rx) = watch::channel(false);
    let (writer, mut reader) = tokio::io::duplex(1024);

    let task = tokio::spawn(write_loop(
        outbox,
        writer,
        closed_rx,
        Duration::from_secs(120),
        metrics.clone(),
    ));

    use tokio::io::AsyncReadExt;
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await.unwrap();
    assert_eq!(prefix, [0, 0, 0, 0]);
    assert_eq!(metrics.posted_keepalives(), 1);

    let _ = closed_tx.send(true);
    task.await.unwrap().unwrap();
}

#[test]
fn interested_sent_only_on_transition() {
    let mut conn = test_conn(4, false);
    assert!(conn.set_interested(true));
    assert!(!conn.set_interested(true));
    assert!(conn.set_interested(false));
}

#[test]
fn non_fast_choke_discards_requests() {
    let mut conn = test_conn(4, false);
    conn.peer_sent_unchoke();
    conn.issue_request(Request::new(0, 0, 0x4000));
    conn.issue_request(Request::new(0, 0x4000, 0x4000));

    let released = conn.peer_sent_choke();
    assert_eq!(released.len(), 2);
    assert_eq!(conn.request_count(), 0);
    assert!(conn.peer_choked);
}

#[test]
fn fast_choke_retains_requests() {
    let mut conn = test_conn(4, true);
    conn.peer_sent_unchoke();
    conn.issue_request(Request::new(0, 0, 0x4000));

    let released = conn.peer_sent_choke();
    assert!(released.is_empty());
    assert_eq!(conn.request_count(), 1);
}

#[test]
fn bitfield_must_be_first_have_message() {
    let mut conn = test_conn(16, false);
    let bits = Bytes::from_static(&[0xFF, 0xFF]);
    conn.peer_sent_bitfield(&bits, 16).unwrap();
    assert!(conn.peer_has_piece(3));
    assert!(matches!(
        conn.peer_sent_bitfield(&bits, 16),
        Err(PeerError::Protocol(_))
    ));
}

#[test]
fn bitfield_after_have_is_rejected() {
    let mut conn = test_conn(16, false);
    conn.peer_sent_have(3, 16).unwrap();
    let bits = Bytes::from_static(&[0xFF, 0xFF]);
    assert!(conn.peer_sent_bitfield(&bits, 16).is_err());
}

#[test]
fn out_of_range_have_is_rejected() {
    let mut conn = test_conn(4, false);
    assert!(matches!(
        conn.peer_sent_have(4, 4),
        Err(PeerError::Protocol(_))
    ));
}

#[test]
fn have_raises_peer_min_pieces() {
    let mut conn = test_conn(100, false);
    conn.peer_sent_have(41, 100).unwrap();
    assert_eq!(conn.peer_min_pieces, 42);
    assert!(conn.peer_has_piece(41));
    assert!(!conn.peer_has_piece(40));
}

#[test]
fn have_all_covers_everything() {
    let mut conn = test_conn(8, true);
    conn.peer_sent_have_all();
    assert!(conn.peer_has_piece(0));
    assert!(conn.peer_has_piece(7));
    conn.peer_sent_have_none();
    assert!(!conn.peer_has_piece(0));
}

#[test]
fn send_have_deduplicates() {
    let (mut conn, outbox) = test_conn_with_outbox(8, false);
    conn.send_have(3);
    conn.send_have(3);
    // One Have on the wire queue, not two.
    let mut queued = 0;
    while let Some(msg) = outbox.pop() {
        assert_eq!(msg, Message::Have { piece: 3 });
        queued += 1;
    }
    assert_eq!(queued, 1);
}
