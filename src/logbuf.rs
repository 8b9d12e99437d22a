//! Per-job append-only log with multi-subscriber replay.
//!
//! The buffer keeps every byte the child ever wrote, as a sequence of
//! cheaply cloneable chunks. A subscriber joining at any point replays
//! from byte zero, then follows live appends. Appends never block on a
//! subscriber: each subscriber has its own delivery task and bounded
//! channel, and one that stops draining while the backlog grows past the
//! lag threshold is cut loose with [`Error::SubscriberLagged`].

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Upper bound for a single stored (and therefore delivered) chunk.
const DELIVERY_CHUNK: usize = 64 * 1024;

pub type LogReceiver = mpsc::Receiver<Result<Bytes, Error>>;

#[derive(Debug)]
pub struct LogBuffer {
    inner: Mutex<Inner>,
    appended: Notify,
    /// Per-subscriber channel capacity, in chunks.
    send_buffer: usize,
    /// Backlog in bytes beyond which a non-draining subscriber is dropped;
    /// 0 disables dropping.
    lag_threshold: u64,
}

#[derive(Default, Debug)]
struct Inner {
    chunks: Vec<Bytes>,
    len: u64,
    closed: bool,
}

impl LogBuffer {
    pub fn new(send_buffer: usize, lag_threshold: u64) -> Arc<Self> {
        Arc::new(LogBuffer {
            inner: Mutex::new(Inner::default()),
            appended: Notify::new(),
            send_buffer: send_buffer.max(1),
            lag_threshold,
        })
    }

    /// Append bytes to the log. Total order across appenders is the lock
    /// acquisition order; appends after close are discarded.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            for piece in bytes.chunks(DELIVERY_CHUNK) {
                inner.chunks.push(Bytes::copy_from_slice(piece));
            }
            inner.len += bytes.len() as u64;
        }
        self.appended.notify_waiters();
    }

    /// Set end-of-stream. Idempotent; caught-up subscribers see their
    /// channels close once they have every byte.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
        }
        self.appended.notify_waiters();
    }

    /// Total bytes appended so far.
    pub fn len(&self) -> u64 {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Contiguous copy of everything appended so far.
    pub fn contents(&self) -> Vec<u8> {
        let inner = self.lock();
        let mut out = Vec::with_capacity(inner.len as usize);
        for chunk in &inner.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Register a subscriber. The returned channel yields the complete
    /// historical contents from byte zero, then each later append, and
    /// closes once end-of-stream has been fully delivered. Firing `cancel`
    /// or dropping the receiver detaches the subscriber without affecting
    /// the appender or other subscribers.
    pub fn subscribe(self: Arc<Self>, cancel: CancellationToken) -> LogReceiver {
        let (tx, rx) = mpsc::channel(self.send_buffer);
        tokio::spawn(async move { self.deliver(tx, cancel).await });
        rx
    }

    async fn deliver(&self, tx: mpsc::Sender<Result<Bytes, Error>>, cancel: CancellationToken) {
        let mut cursor = 0usize;
        let mut offset = 0u64;
        loop {
            // The fast try_send path below never awaits, so a continuously
            // producing appender would otherwise starve cancellation.
            if cancel.is_cancelled() {
                return;
            }

            // Register for the wakeup before inspecting state so an append
            // between the check and the await is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (next, backlog, closed) = {
                let inner = self.lock();
                (inner.chunks.get(cursor).cloned(), inner.len - offset, inner.closed)
            };

            match next {
                Some(chunk) => {
                    let n = chunk.len() as u64;
                    match tx.try_send(Ok(chunk)) {
                        Ok(()) => {
                            cursor += 1;
                            offset += n;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                        Err(mpsc::error::TrySendError::Full(item)) => {
                            if self.lag_threshold > 0 && backlog > self.lag_threshold {
                                let _ = tx.send(Err(Error::SubscriberLagged { behind: backlog })).await;
                                return;
                            }
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                sent = tx.send(item) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                    cursor += 1;
                                    offset += n;
                                }
                            }
                        }
                    }
                }
                None if closed => return,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
