//! # SheeldLink Core Library
//!
//! Host-side driver for Bluetooth shield boards.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Shield frame encoding and a resynchronizing inbound stream decoder
//! - Per-board sessions: handshake, pin I/O, version queries, board testing
//!   and renaming, callback-aware frame pacing
//! - A scan/connect state machine with bounded retries and a registry of up
//!   to seven connected boards
//! - Stream and chunked transports over platform-supplied links
//!
//! Platform radio access stays outside the crate: plug it in through the
//! [`transport::Link`], [`transport::LinkFactory`] and [`manager::Scanner`]
//! traits. A serial-port link is included for hosts that bind paired boards
//! to a serial device.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sheeldlink_core::prelude::*;
//! use sheeldlink_core::transport::serial::{SerialLinkFactory, SerialScanner};
//!
//! let backend = Backend::new(vec![Arc::new(SerialLinkFactory::default())])
//!     .with_scanner(Arc::new(SerialScanner::new()));
//! let manager = Manager::new(ManagerConfig::default(), backend)?;
//! let mut events = manager.subscribe();
//!
//! manager.scan()?;
//! while let Ok(event) = events.recv().await {
//!     if let ManagerEvent::BoardFound(board) = event {
//!         manager.cancel_scanning();
//!         manager.connect(&board)?;
//!     }
//! }
//! ```

pub mod config;
pub mod device;
pub mod manager;
pub mod protocol;
pub mod timer;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ChunkConfig, DeviceConfig, ManagerConfig, RetryConfig};
    pub use crate::device::{BoardInfo, Device, DeviceEvent, DeviceState, DisconnectReason};
    pub use crate::manager::{
        Backend, ConnectionState, DiscoveredDevice, DiscoveryEvent, Manager, ManagerEvent, Scanner,
    };
    pub use crate::protocol::{OperationError, PinMode, ProtocolError, ShieldFrame};
    pub use crate::timer::TimeoutTimer;
    pub use crate::transport::{Link, LinkFactory, Transport, TransportKind};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
