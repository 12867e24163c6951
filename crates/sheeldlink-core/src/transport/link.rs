//! Link abstraction
//!
//! A link is the platform's raw byte channel to one board. The driver never
//! touches a radio directly; platforms plug in through these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::device::BoardInfo;
use crate::protocol::ProtocolError;

/// How a board's link carries bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransportKind {
    /// Direct byte socket (classic Bluetooth RFCOMM, serial port)
    #[default]
    Stream,
    /// Small acknowledged writes and notification-based reads (BLE characteristic)
    Chunked,
}

/// Raw byte channel to a board
#[async_trait]
pub trait Link: Send + Sync {
    /// Establish the channel
    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Wait for the next inbound bytes. Errors once the channel is closed or broken.
    async fn read(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Write bytes. Chunked links resolve only after the write is acknowledged.
    async fn write(&self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Close the channel, unblocking any pending read
    async fn close(&self);

    /// Largest write the link accepts in one call, if limited
    fn max_write_len(&self) -> Option<usize> {
        None
    }
}

/// One way of constructing a link for a board.
///
/// Some platforms need several construction methods for the same kind of
/// link; the connector rotates through the factories registered for a kind.
pub trait LinkFactory: Send + Sync {
    /// Strategy name for logs
    fn name(&self) -> &str;

    /// Kind of link this factory builds
    fn kind(&self) -> TransportKind;

    /// Build an unconnected link for `board`
    fn open(&self, board: &BoardInfo) -> Result<Arc<dyn Link>, ProtocolError>;
}
