//! Chunked writes for constrained-payload links
//!
//! Large writes are split into chunks, each acknowledged before the next is
//! sent. Small writes are held back and coalesced until a chunk fills up or
//! the link has been idle for the flush delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::Link;
use crate::config::ChunkConfig;
use crate::lock;
use crate::protocol::ProtocolError;
use crate::timer::TimeoutTimer;

/// Transport over a link that only accepts small acknowledged writes
#[derive(Clone)]
pub struct ChunkedTransport {
    inner: Arc<ChunkedInner>,
}

struct ChunkedInner {
    link: Arc<dyn Link>,
    chunk_size: usize,
    flush_delay: Duration,
    pending: tokio::sync::Mutex<Vec<u8>>,
    flush_timer: Mutex<Option<TimeoutTimer>>,
    closed: AtomicBool,
}

impl ChunkedTransport {
    /// Wrap a connected link. The chunk size is the smaller of the configured
    /// size and the link's own limit.
    pub fn new(link: Arc<dyn Link>, config: &ChunkConfig) -> Self {
        let chunk_size = link
            .max_write_len()
            .map_or(config.chunk_size, |max| max.min(config.chunk_size))
            .max(1);
        Self {
            inner: Arc::new(ChunkedInner {
                link,
                chunk_size,
                flush_delay: config.flush_delay(),
                pending: tokio::sync::Mutex::new(Vec::new()),
                flush_timer: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Effective chunk size
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Wait for inbound bytes
    pub async fn read(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        self.inner.link.read().await
    }

    /// Write bytes, chunking or buffering them as needed
    pub async fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        let mut pending = inner.pending.lock().await;

        if data.len() >= inner.chunk_size {
            inner.cancel_flush();
            if !pending.is_empty() {
                let buffered = std::mem::take(&mut *pending);
                inner.write_chunks(&buffered).await?;
            }
            return inner.write_chunks(data).await;
        }

        pending.extend_from_slice(data);
        while pending.len() >= inner.chunk_size {
            let chunk: Vec<u8> = pending.drain(..inner.chunk_size).collect();
            inner.link.write(&chunk).await?;
        }

        if pending.is_empty() {
            inner.cancel_flush();
        } else {
            ChunkedInner::arm_flush(inner);
        }
        Ok(())
    }

    /// Stop accepting writes and drop the pending flush. Buffered bytes are
    /// never written after this returns.
    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.cancel_flush();
    }

    /// Close the link, discarding unflushed bytes
    pub async fn close(&self) {
        self.mark_closed();
        self.inner.pending.lock().await.clear();
        self.inner.link.close().await;
    }
}

impl ChunkedInner {
    async fn write_chunks(&self, data: &[u8]) -> Result<(), ProtocolError> {
        for chunk in data.chunks(self.chunk_size) {
            self.link.write(chunk).await?;
        }
        Ok(())
    }

    async fn flush_pending(&self) -> Result<(), ProtocolError> {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() || self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let buffered = std::mem::take(&mut *pending);
        self.write_chunks(&buffered).await
    }

    /// (Re)start the inactivity countdown for the pending buffer
    fn arm_flush(this: &Arc<Self>) {
        let mut timer = lock(&this.flush_timer);
        if let Some(existing) = timer.as_ref().filter(|t| t.is_alive()) {
            existing.reset();
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(this);
        *timer = Some(TimeoutTimer::start(this.flush_delay, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Err(e) = inner.flush_pending().await {
                    tracing::warn!("chunk flush failed, closing link: {}", e);
                    inner.closed.store(true, Ordering::SeqCst);
                    inner.link.close().await;
                }
            });
        }));
    }

    fn cancel_flush(&self) {
        let mut timer = lock(&self.flush_timer);
        if let Some(existing) = timer.take() {
            existing.stop();
        }
    }
}
