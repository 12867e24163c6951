//! Events published by a device

use crate::protocol::{OperationError, ShieldFrame};

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called, or a new session replaced this one
    Requested,
    /// Reading or writing the transport failed
    TransportFailure(String),
    /// The board asked for a transport reset
    BoardReset,
}

/// Notifications delivered to device subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Handshake finished; the device accepts commands
    Connected,
    /// The session ended
    Disconnected { reason: DisconnectReason },
    /// An input pin changed level
    DigitalPinChanged { pin: u8, value: bool },
    /// Raw value of a reported input port
    DigitalPortReport { port: u8, value: u8 },
    /// Firmware version answer
    FirmwareVersion { major: u8, minor: u8 },
    /// Library version answer
    LibraryVersion(u8),
    /// Frame from a shield other than the configuration shield
    Frame(ShieldFrame),
    /// Raw serial passthrough bytes
    SerialData(Vec<u8>),
    /// Sysex message the driver does not handle itself
    UnknownSysex { command: u8, data: Vec<u8> },
    /// Firmware answered the testing challenge
    FirmwareTestResult { passed: bool },
    /// Library answered the testing challenge
    LibraryTestResult { passed: bool },
    /// Board testing deadline passed before both answers arrived
    TestingTimedOut {
        firmware_answered: bool,
        library_answered: bool,
    },
    /// Renaming request retransmitted
    RenamingRetry { attempt: u32 },
    /// Every renaming transmission went unanswered
    RenamingTimedOut,
    /// Board acknowledged the new name
    Renamed(String),
    /// A request was refused
    Error(OperationError),
}
