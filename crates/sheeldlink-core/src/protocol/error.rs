//! Protocol errors

use thiserror::Error;

/// Errors raised synchronously by the protocol, transport and configuration layers
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected to board")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Library not initialized: {0}")]
    NotInitialized(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Pin {pin} out of range (0..{count})")]
    PinOutOfRange { pin: u8, count: u8 },

    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("Check byte mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Sysex payload too long: {0} encoded bytes")]
    SysexTooLong(usize),

    #[error("Sysex payload has odd length {0}")]
    OddSysexLength(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operational conflicts reported asynchronously through event channels.
///
/// The operation that produced one of these is refused; nothing else changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("A scan is already in progress")]
    ScanInProgress,

    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    #[error("Device {0} is already connected")]
    AlreadyConnected(String),

    #[error("Maximum of {0} connected devices reached")]
    CapacityReached(usize),

    #[error("Device {0} is not connected")]
    NotConnected(String),

    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),
}
