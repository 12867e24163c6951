//! Protocol commands
//!
//! Defines the command bytes understood by the board firmware and the
//! configuration shield of the board library.

use serde::{Deserialize, Serialize};

/// Firmware-level commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Digital port value, channel = port (`0x90`)
    DigitalMessage,

    /// Analog/PWM pin value, channel = pin (`0xE0`)
    AnalogMessage,

    /// Enable/disable digital change reports for a port (`0xD0`)
    ReportDigital,

    /// Set the mode of a single pin (`0xF4`)
    SetPinMode,

    /// Firmware version request/response (`0xF9`)
    ReportVersion,

    /// Start of a sysex message (`0xF0`)
    StartSysex,

    /// End of a sysex message (`0xF7`)
    EndSysex,
}

impl Command {
    /// Get the command byte (channel bits cleared)
    pub fn byte(&self) -> u8 {
        match self {
            Command::DigitalMessage => 0x90,
            Command::AnalogMessage => 0xE0,
            Command::ReportDigital => 0xD0,
            Command::SetPinMode => 0xF4,
            Command::ReportVersion => 0xF9,
            Command::StartSysex => 0xF0,
            Command::EndSysex => 0xF7,
        }
    }

    /// Get the command byte combined with a channel (port or pin) selector
    pub fn with_channel(&self, channel: u8) -> u8 {
        self.byte() | (channel & 0x0F)
    }

    /// Resolve a full command byte (`>= 0xF0`)
    pub fn from_full_byte(byte: u8) -> Option<Self> {
        match byte {
            0xF4 => Some(Command::SetPinMode),
            0xF9 => Some(Command::ReportVersion),
            0xF0 => Some(Command::StartSysex),
            0xF7 => Some(Command::EndSysex),
            _ => None,
        }
    }

    /// Resolve a channel command from its high nibble
    pub fn from_high_nibble(byte: u8) -> Option<Self> {
        match byte & 0xF0 {
            0x90 => Some(Command::DigitalMessage),
            0xE0 => Some(Command::AnalogMessage),
            0xD0 => Some(Command::ReportDigital),
            _ => None,
        }
    }
}

/// Sysex command ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SysexCommand {
    /// Ask for a one-shot report of all input pins
    ReportInputPins,
    /// Board asks the host to reset the Bluetooth link
    BluetoothReset,
    /// Liveness ping, echoed by the host
    IsAlive,
    /// Firmware half of the board testing challenge
    BoardTesting,
    /// Mute/unmute firmware traffic
    MuteFirmata,
    /// Rename the board's Bluetooth module
    BoardRenaming,
    /// Serial passthrough carrying shield frames
    SerialData,
}

impl SysexCommand {
    /// Get the sysex command id
    pub fn byte(&self) -> u8 {
        match self {
            SysexCommand::ReportInputPins => 0x5F,
            SysexCommand::BluetoothReset => 0x61,
            SysexCommand::IsAlive => 0x62,
            SysexCommand::BoardTesting => 0x63,
            SysexCommand::MuteFirmata => 0x64,
            SysexCommand::BoardRenaming => 0x65,
            SysexCommand::SerialData => 0x66,
        }
    }

    /// Resolve a sysex command id, `None` for ids this driver does not handle
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x5F => Some(SysexCommand::ReportInputPins),
            0x61 => Some(SysexCommand::BluetoothReset),
            0x62 => Some(SysexCommand::IsAlive),
            0x63 => Some(SysexCommand::BoardTesting),
            0x64 => Some(SysexCommand::MuteFirmata),
            0x65 => Some(SysexCommand::BoardRenaming),
            0x66 => Some(SysexCommand::SerialData),
            _ => None,
        }
    }
}

/// Pin modes accepted by `SET_PIN_MODE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinMode {
    Input,
    Output,
    Analog,
    Pwm,
}

impl PinMode {
    /// Get the mode byte
    pub fn byte(&self) -> u8 {
        match self {
            PinMode::Input => 0x00,
            PinMode::Output => 0x01,
            PinMode::Analog => 0x02,
            PinMode::Pwm => 0x03,
        }
    }
}

/// Frames exchanged with the configuration shield of the board library
pub mod config_shield {
    /// Shield id of the library's own configuration shield
    pub const SHIELD_ID: u8 = 0x00;

    // host -> board
    pub const QUERY_LIBRARY_VERSION: u8 = 0x01;
    pub const HOST_CONNECTED: u8 = 0x02;
    pub const LIBRARY_TESTING_CHALLENGE: u8 = 0x05;

    // board -> host
    pub const LIBRARY_VERSION: u8 = 0x01;
    pub const CALLBACK_ENTERED: u8 = 0x03;
    pub const CALLBACK_EXITED: u8 = 0x04;
    pub const LIBRARY_TESTING_ANSWER: u8 = 0x05;

    /// Prefix of the library testing challenge
    pub const TESTING_REQUEST: &str = "Are you ok?";
    /// Prefix the library answers the challenge with
    pub const TESTING_ANSWER: &str = "Yup, I'm feeling great!";
}
