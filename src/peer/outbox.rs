//! Outbound message queue and writer loop.
//!
//! Messages are posted into a FIFO queue that the per-connection writer
//! task drains into a buffered socket writer, flushing whenever the queue
//! empties. A Cancel that catches its Request still sitting in the queue
//! deletes the Request and is itself dropped, so the socket sees neither.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{watch, Notify};

use super::error::PeerError;
use super::wire::Message;
use crate::metrics::Metrics;

/// Shared handle to a connection's outbound queue.
#[derive(Clone)]
pub struct Outbox {
    shared: Arc<Shared>,
}

struct Shared {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    metrics: Arc<Metrics>,
}

impl Outbox {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                metrics,
            }),
        }
    }

    /// Enqueues a message for the writer, coalescing Cancel against a
    /// not-yet-written Request for the same chunk.
    pub fn post(&self, msg: Message) {
        {
            let mut queue = self.shared.queue.lock();
            if let Message::Cancel {
                index,
                begin,
                length,
            } = msg
            {
                let request = Message::Request {
                    index,
                    begin,
                    length,
                };
                if let Some(pos) = queue.iter().position(|m| *m == request) {
                    queue.remove(pos);
                    self.shared
                        .metrics
                        .optimized_cancels
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            queue.push_back(msg);
        }
        self.shared.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Message> {
        self.shared.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }

    async fn wait(&self) {
        self.shared.notify.notified().await;
    }
}

/// Drains an [`Outbox`] into the socket until the connection closes or the
/// write side fails. Pushes a keepalive when nothing has been written for
/// `keepalive`.
pub async fn write_loop<W>(
    outbox: Outbox,
    writer: W,
    mut closed: watch::Receiver<bool>,
    keepalive: Duration,
    metrics: Arc<Metrics>,
) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = BufWriter::new(writer);
    let mut last_write = tokio::time::Instant::now();
    loop {
        if *closed.borrow() {
            return Ok(());
        }
        if let Some(msg) = outbox.pop() {
            sink.write_all(&msg.encode()).await?;
            last_write = tokio::time::Instant::now();
            continue;
        }
        // Queue drained: flush what we batched, then wait for more work.
        sink.flush().await?;
        tokio::select! {
            _ = outbox.wait() => {}
            _ = tokio::time::sleep_until(last_write + keepalive) => {
                outbox.post(Message::KeepAlive);
                metrics.posted_keepalives.fetch_add(1, Ordering::Relaxed);
            }
            res = closed.changed() => {
                if res.is_err() || *closed.borrow() {
                    let _ = sink.flush().await;
                    return Ok(());
                }
            }
        }
    }
}
