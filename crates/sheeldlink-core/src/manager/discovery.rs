//! Discovery contract
//!
//! Platforms report nearby devices through a [`Scanner`]. The manager
//! decides which of them are boards.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::ProtocolError;
use crate::transport::TransportKind;

/// A device reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Advertised name, `None` if the platform could not resolve it
    pub name: Option<String>,
    /// Stable transport address
    pub address: String,
    /// Whether the platform reports the device as paired
    pub paired: bool,
    /// Link kind, if the platform knows it
    pub kind: Option<TransportKind>,
}

/// Events emitted while discovery runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A device was seen
    DeviceFound(DiscoveredDevice),
    /// The platform ended discovery on its own
    Finished,
}

/// Platform device discovery
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Begin discovery, reporting devices on `events` until stopped
    async fn start_discovery(
        &self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<(), ProtocolError>;

    /// Stop discovery. Safe to call when not running.
    async fn stop_discovery(&self);
}

/// Whether a discovered device is a board.
///
/// Unresolved names count as boards so they are not silently dropped.
pub fn is_board(name: Option<&str>, markers: &[String]) -> bool {
    let Some(name) = name else {
        return true;
    };
    let name = name.to_lowercase();
    markers
        .iter()
        .any(|marker| name.contains(&marker.to_lowercase()))
}
