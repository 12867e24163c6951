//! Board identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Identity of a board as seen during discovery.
///
/// The address never changes once constructed; the name may change on
/// discovery updates or after a successful rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    address: String,

    /// Advertised name, if the platform resolved one
    pub name: Option<String>,

    /// Whether the platform reports the board as paired
    pub paired: bool,

    /// How the board's link carries bytes
    pub kind: TransportKind,

    /// When discovery last reported the board
    pub discovered_at: Option<DateTime<Utc>>,
}

impl BoardInfo {
    /// Create an unnamed, unpaired board identity
    pub fn new(address: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            address: address.into(),
            name: None,
            paired: false,
            kind,
            discovered_at: None,
        }
    }

    /// Set the advertised name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the paired flag
    pub fn with_paired(mut self, paired: bool) -> Self {
        self.paired = paired;
        self
    }

    /// Stable transport address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Name for display, falling back to the address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}
