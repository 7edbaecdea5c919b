//! Internal counters, readable without locking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Client-wide counters. Cheap enough to bump from any task.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Cancels that deleted a still-queued Request instead of hitting the wire.
    pub optimized_cancels: AtomicU64,
    /// Keepalives written after an idle interval.
    pub posted_keepalives: AtomicU64,
    /// Chunks received that matched an outstanding request.
    pub useful_chunks_received: AtomicU64,
    /// Chunks received with no matching request (fatal for the connection).
    pub unwanted_chunks_received: AtomicU64,
    /// Chunks uploaded to peers.
    pub chunks_sent: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimized_cancels(&self) -> u64 {
        self.optimized_cancels.load(Ordering::Relaxed)
    }

    pub fn posted_keepalives(&self) -> u64 {
        self.posted_keepalives.load(Ordering::Relaxed)
    }

    pub fn useful_chunks_received(&self) -> u64 {
        self.useful_chunks_received.load(Ordering::Relaxed)
    }

    pub fn unwanted_chunks_received(&self) -> u64 {
        self.unwanted_chunks_received.load(Ordering::Relaxed)
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }
}
