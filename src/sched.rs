//! Request scheduling.
//!
//! Decides, per connection, which chunk requests to keep outstanding given
//! piece priorities, peer bitfields, the allowed-fast set, and what other
//! connections are already responsible for. The comparator ranks an
//! enumerated candidate list; [`apply_desired_state`] then walks it,
//! taking over requests from other connections only under the load-shed
//! rule, and stops at the per-peer cap.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

use crate::peer::ConnId;
use crate::torrent::{PiecePriority, Request, Torrent};

/// What the scheduler wants a connection's outstanding set to look like.
pub struct DesiredState {
    pub interested: bool,
    /// Candidate requests, best first.
    pub candidates: Vec<Request>,
}

/// Computes the ranked request candidates for one connection.
pub fn desired_requests(t: &Torrent, id: ConnId) -> DesiredState {
    let mut desired = DesiredState {
        interested: false,
        candidates: Vec::new(),
    };
    if t.closed {
        return desired;
    }
    let Some(conn) = t.conns.get(&id) else {
        return desired;
    };

    let mut availability: HashMap<u32, usize> = HashMap::new();
    for index in 0..t.num_pieces() as u32 {
        if !t.want_piece(index) || !conn.peer_has_piece(index) {
            continue;
        }
        availability
            .entry(index)
            .or_insert_with(|| t.availability(index));
        let allowed_fast = conn.peer_allowed_fast.contains(&index);
        let Some(piece) = t.pieces.get(index as usize) else {
            continue;
        };
        for chunk in &piece.pending_chunks {
            let r = Request {
                piece: index,
                chunk: *chunk,
            };
            if !allowed_fast {
                // Plain requests need interest signaled, and can only be
                // made (or sustained) when unchoked or already in flight.
                desired.interested = true;
                if conn.peer_choked && !conn.request_pending(&r) {
                    continue;
                }
            }
            desired.candidates.push(r);
        }
    }

    desired
        .candidates
        .sort_by(|a, b| compare_candidates(t, id, &availability, a, b));
    desired
}

/// The candidate ordering. Earlier means requested sooner.
fn compare_candidates(
    t: &Torrent,
    id: ConnId,
    availability: &HashMap<u32, usize>,
    a: &Request,
    b: &Request,
) -> Ordering {
    let conn = match t.conns.get(&id) {
        Some(c) => c,
        None => return Ordering::Equal,
    };

    // While choked, pieces outside the allowed-fast set sink to the bottom;
    // they are only kept at all because fast peers retain requests across
    // a choke.
    if conn.peer_choked {
        let a_blocked = !conn.peer_allowed_fast.contains(&a.piece);
        let b_blocked = !conn.peer_allowed_fast.contains(&b.piece);
        match a_blocked.cmp(&b_blocked) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    // Ours, then unowned, then owned by someone else.
    let class = |r: &Request| match t.pending_requests.get(r) {
        Some(owner) if *owner == id => 0u8,
        None => 1,
        Some(_) => 2,
    };
    let (class_a, class_b) = (class(a), class(b));
    match class_a.cmp(&class_b) {
        Ordering::Equal => {}
        other => return other,
    }

    if class_a == 2 {
        // Both owned elsewhere: shed load off the busier owner first, and
        // among those prefer the most recently requested chunk. The recent
        // one sits deepest in the remote's queue, so canceling it wastes
        // the least.
        let outstanding = |r: &Request| {
            t.pending_requests
                .get(r)
                .and_then(|owner| t.conns.get(owner))
                .map(|c| c.request_count())
                .unwrap_or(0)
        };
        match outstanding(b).cmp(&outstanding(a)) {
            Ordering::Equal => {}
            other => return other,
        }
        let last = |r: &Request| t.last_requested.get(r).copied();
        match last(b).cmp(&last(a)) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    let priority = |r: &Request| {
        t.pieces
            .get(r.piece as usize)
            .map(|p| p.priority)
            .unwrap_or(PiecePriority::None)
    };
    match priority(b).cmp(&priority(a)) {
        Ordering::Equal => {}
        other => return other,
    }

    // Better-replicated pieces first: finishing them off shrinks the
    // pending map fastest. Availability is a tiebreak, not the primary key.
    let avail = |r: &Request| availability.get(&r.piece).copied().unwrap_or(0);
    avail(b).cmp(&avail(a))
}

/// Transmits a desired state: adjusts interest, takes over or issues
/// requests up to `min(peer_max_requests, cap)`.
pub fn apply_desired_state(t: &mut Torrent, id: ConnId, desired: DesiredState, cap: usize) {
    let max = {
        let Some(conn) = t.conns.get_mut(&id) else {
            return;
        };
        conn.set_interested(desired.interested);
        conn.peer_max_requests.min(cap)
    };

    for r in desired.candidates {
        let (count, mine, my_last) = match t.conns.get(&id) {
            Some(c) => (
                c.request_count(),
                c.request_pending(&r),
                c.last_useful_chunk_received,
            ),
            None => return,
        };
        if count >= max {
            break;
        }
        if mine {
            continue;
        }

        if let Some(owner) = t.pending_requests.get(&r).copied() {
            if owner != id {
                let (theirs, their_last) = t
                    .conns
                    .get(&owner)
                    .map(|c| (c.request_count() as i64, c.last_useful_chunk_received))
                    .unwrap_or((0, None));
                let diff = (count as i64 + 1) - (theirs - 1);
                let steal = diff > 1 || (diff == 1 && my_last > their_last);
                if !steal {
                    continue;
                }
                if let Some(victim) = t.conns.get_mut(&owner) {
                    victim.cancel_request(r);
                }
                t.pending_requests.remove(&r);
                t.last_requested.remove(&r);
            }
        }

        if let Some(conn) = t.conns.get_mut(&id) {
            conn.issue_request(r);
        }
        t.pending_requests.insert(r, id);
        t.last_requested.insert(r, Instant::now());
    }
}

/// Re-evaluates a connection's requests unless it is comfortably above its
/// low-water mark, which keeps every received chunk from churning the
/// scheduler.
pub fn update_requests(t: &mut Torrent, id: ConnId, cap: usize) {
    {
        let Some(conn) = t.conns.get(&id) else {
            return;
        };
        if conn.interested
            && !conn.peer_choked
            && conn.request_count() > conn.requests_low_water
        {
            return;
        }
    }
    let desired = desired_requests(t, id);
    apply_desired_state(t, id, desired, cap);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_REQUEST_CAP;
    use crate::metrics::Metrics;
    use crate::peer::{Conn, Outbox, PeerId};
    use crate::torrent::{InfoHash, PeerSource, PieceState, TorrentMeta};
    use std::sync::Arc;
    use tokio::sync::watch;

    fn meta(num_pieces: usize, piece_length: u32) -> TorrentMeta {
        TorrentMeta {
            info_hash: InfoHash([7u8; 20]),
            name: "t".into(),
            piece_length,
            total_length: piece_length as u64 * num_pieces as u64,
            piece_hashes: vec![[0u8; 20]; num_pieces],
            files: vec![crate::torrent::MetaFile {
                path: "t.bin".into(),
                length: piece_length as u64 * num_pieces as u64,
            }],
        }
    }

    fn torrent_with_incomplete_pieces(num_pieces: usize) -> Torrent {
        let mut t = Torrent::new(meta(num_pieces, 0x8000));
        for i in 0..num_pieces as u32 {
            t.pieces[i as usize].state = PieceState::Incomplete;
            t.pieces[i as usize].pending_chunks = t.piece_chunk_specs(i);
        }
        t
    }

    fn add_conn(t: &mut Torrent, id: u64, tag: u8) -> ConnId {
        let cid = ConnId(id);
        let (closed_tx, _closed_rx) = watch::channel(false);
        let conn = Conn::new(
            cid,
            ([127, 0, 0, 1], 6881 + id as u16).into(),
            PeerSource::Tracker,
            PeerId([tag; 20]),
            [0u8; 8],
            false,
            t.num_pieces(),
            Outbox::new(Arc::new(Metrics::new())),
            closed_tx,
        );
        t.conns.insert(cid, conn);
        cid
    }

    fn unchoke_with_all_pieces(t: &mut Torrent, cid: ConnId) {
        let n = t.num_pieces();
        let conn = t.conns.get_mut(&cid).unwrap();
        conn.peer_sent_unchoke();
        for i in 0..n as u32 {
            conn.peer_sent_have(i, n).unwrap();
        }
    }

    #[test]
    fn choked_peer_yields_no_plain_requests() {
        let mut t = torrent_with_incomplete_pieces(2);
        let cid = add_conn(&mut t, 1, b'a');
        let n = t.num_pieces();
        t.conns
            .get_mut(&cid)
            .unwrap()
            .peer_sent_have(0, n)
            .unwrap();

        let desired = desired_requests(&t, cid);
        assert!(desired.interested);
        assert!(desired.candidates.is_empty());
    }

    #[test]
    fn allowed_fast_requestable_while_choked() {
        let mut t = torrent_with_incomplete_pieces(2);
        let cid = add_conn(&mut t, 1, b'a');
        let n = t.num_pieces();
        {
            let conn = t.conns.get_mut(&cid).unwrap();
            conn.peer_sent_have(0, n).unwrap();
            conn.add_allowed_fast(0);
        }
        let desired = desired_requests(&t, cid);
        assert!(desired.candidates.iter().all(|r| r.piece == 0));
        assert!(!desired.candidates.is_empty());
    }

    #[test]
    fn fills_up_to_cap() {
        let mut t = torrent_with_incomplete_pieces(40);
        let cid = add_conn(&mut t, 1, b'a');
        unchoke_with_all_pieces(&mut t, cid);

        update_requests(&mut t, cid, DEFAULT_REQUEST_CAP);
        let conn = &t.conns[&cid];
        assert_eq!(conn.request_count(), DEFAULT_REQUEST_CAP);
        assert!(conn.interested);
        for r in conn.requests() {
            assert_eq!(t.pending_requests.get(r), Some(&cid));
        }
    }

    #[test]
    fn respects_peer_max_requests() {
        let mut t = torrent_with_incomplete_pieces(40);
        let cid = add_conn(&mut t, 1, b'a');
        unchoke_with_all_pieces(&mut t, cid);
        t.conns.get_mut(&cid).unwrap().peer_max_requests = 5;

        update_requests(&mut t, cid, DEFAULT_REQUEST_CAP);
        assert_eq!(t.conns[&cid].request_count(), 5);
    }

    #[test]
    fn duplicate_requests_stay_on_first_peer() {
        let mut t = torrent_with_incomplete_pieces(1);
        let a = add_conn(&mut t, 1, b'a');
        let b = add_conn(&mut t, 2, b'b');
        unchoke_with_all_pieces(&mut t, a);
        unchoke_with_all_pieces(&mut t, b);

        update_requests(&mut t, a, DEFAULT_REQUEST_CAP);
        let first = *t.conns[&a].requests().next().unwrap();

        update_requests(&mut t, b, DEFAULT_REQUEST_CAP);
        // Neither delivered a chunk yet, so b has no claim on a's request.
        assert!(!t.conns[&b].request_pending(&first));
        assert_eq!(t.pending_requests.get(&first), Some(&a));
    }

    #[test]
    fn higher_priority_pieces_rank_first() {
        let mut t = torrent_with_incomplete_pieces(3);
        let cid = add_conn(&mut t, 1, b'a');
        unchoke_with_all_pieces(&mut t, cid);
        t.pieces[2].priority = PiecePriority::Now;

        let desired = desired_requests(&t, cid);
        assert_eq!(desired.candidates[0].piece, 2);
    }

    #[test]
    fn availability_breaks_priority_ties() {
        let mut t = torrent_with_incomplete_pieces(2);
        let a = add_conn(&mut t, 1, b'a');
        let b = add_conn(&mut t, 2, b'b');
        unchoke_with_all_pieces(&mut t, a);
        // Only piece 1 is replicated on the second peer.
        let n = t.num_pieces();
        t.conns.get_mut(&b).unwrap().peer_sent_have(1, n).unwrap();

        let desired = desired_requests(&t, a);
        assert_eq!(desired.candidates[0].piece, 1);
    }

    #[test]
    fn none_priority_excludes_piece() {
        let mut t = torrent_with_incomplete_pieces(2);
        let cid = add_conn(&mut t, 1, b'a');
        unchoke_with_all_pieces(&mut t, cid);
        t.pieces[0].priority = PiecePriority::None;

        let desired = desired_requests(&t, cid);
        assert!(desired.candidates.iter().all(|r| r.piece == 1));
    }

    #[test]
    fn low_water_mark_suppresses_refill() {
        let mut t = torrent_with_incomplete_pieces(40);
        let cid = add_conn(&mut t, 1, b'a');
        unchoke_with_all_pieces(&mut t, cid);

        update_requests(&mut t, cid, 8);
        assert_eq!(t.conns[&cid].request_count(), 8);

        // Simulate delivery of one chunk: still above low water, no refill.
        let r = *t.conns[&cid].requests().next().unwrap();
        t.conns.get_mut(&cid).unwrap().remove_request(&r);
        t.pending_requests.remove(&r);
        t.last_requested.remove(&r);
        t.pieces[r.piece as usize].pending_chunks.remove(&r.chunk);

        update_requests(&mut t, cid, 8);
        assert_eq!(t.conns[&cid].request_count(), 7);
    }
}
