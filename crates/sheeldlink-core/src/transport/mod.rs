//! Board transports
//!
//! A [`Transport`] is an established session with one board, built on top of
//! a platform [`Link`]. Two variants exist:
//! - [`StreamTransport`]: bytes pass straight through to the link.
//! - [`ChunkedTransport`]: writes are split, acknowledged and coalesced for
//!   links with a small maximum payload.
//!
//! The [`Connector`] establishes transports with bounded retries.

mod chunked;
mod connector;
mod link;
pub mod serial;

use std::sync::Arc;

pub use chunked::ChunkedTransport;
pub use connector::{Connector, RetryBudget};
pub use link::{Link, LinkFactory, TransportKind};

use crate::config::ChunkConfig;
use crate::protocol::ProtocolError;

/// Transport over a byte-stream link
#[derive(Clone)]
pub struct StreamTransport {
    link: Arc<dyn Link>,
}

impl StreamTransport {
    /// Wrap a connected link
    pub fn new(link: Arc<dyn Link>) -> Self {
        Self { link }
    }

    /// Wait for inbound bytes
    pub async fn read(&self) -> Result<Vec<u8>, ProtocolError> {
        self.link.read().await
    }

    /// Write bytes as-is
    pub async fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        self.link.write(data).await
    }

    /// Close the link
    pub async fn close(&self) {
        self.link.close().await;
    }
}

/// An established session with a board
#[derive(Clone)]
pub enum Transport {
    /// Direct byte stream
    Stream(StreamTransport),
    /// Chunked, acknowledged writes
    Chunked(ChunkedTransport),
}

impl Transport {
    /// Wrap a connected link in the variant matching `kind`
    pub fn new(link: Arc<dyn Link>, kind: TransportKind, chunk: &ChunkConfig) -> Self {
        match kind {
            TransportKind::Stream => Transport::Stream(StreamTransport::new(link)),
            TransportKind::Chunked => Transport::Chunked(ChunkedTransport::new(link, chunk)),
        }
    }

    /// Kind of this transport
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Stream(_) => TransportKind::Stream,
            Transport::Chunked(_) => TransportKind::Chunked,
        }
    }

    /// Wait for inbound bytes
    pub async fn read(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Transport::Stream(t) => t.read().await,
            Transport::Chunked(t) => t.read().await,
        }
    }

    /// Write bytes
    pub async fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        match self {
            Transport::Stream(t) => t.write(data).await,
            Transport::Chunked(t) => t.write(data).await,
        }
    }

    /// Refuse further writes right away. The link itself is closed by [`Transport::close`].
    pub(crate) fn mark_closed(&self) {
        if let Transport::Chunked(t) = self {
            t.mark_closed();
        }
    }

    /// Close the session, discarding anything not yet written
    pub async fn close(&self) {
        match self {
            Transport::Stream(t) => t.close().await,
            Transport::Chunked(t) => t.close().await,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Transport").field(&self.kind()).finish()
    }
}
