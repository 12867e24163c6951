//! Board Protocol
//!
//! Implements the wire protocol spoken by the board: a firmware command
//! stream with 7-bit sysex messages, and shield frames carried inside the
//! serial passthrough sysex.

pub mod commands;
pub mod decoder;
mod error;
mod frame;
pub mod sysex;

pub use commands::{config_shield, Command, PinMode, SysexCommand};
pub use decoder::{
    DecodedEvent, FirmataParser, FrameAssembler, InboundFrame, StreamDecoder, StreamEvent,
};
pub use error::{OperationError, ProtocolError};
pub use frame::ShieldFrame;
pub use sysex::{build_sysex, decode_7bit, encode_7bit};

/// Marks the start of a shield frame
pub const START_OF_FRAME: u8 = 0xFF;

/// Marks the end of a shield frame
pub const END_OF_FRAME: u8 = 0x00;

/// Maximum length of a single frame argument
pub const MAX_ARGUMENT_LEN: usize = 255;

/// Maximum number of arguments in a frame
pub const MAX_ARGUMENTS: usize = 255;

/// Maximum sysex payload after 7-bit expansion
pub const MAX_SYSEX_PAYLOAD: usize = 32;

/// Raw bytes per SERIAL_DATA message, sized so the whole sysex message fits in 32 bytes
pub const MAX_FRAME_CHUNK: usize = (MAX_SYSEX_PAYLOAD - 3) / 2;

/// Maximum inbound sysex size before the message is dropped
pub const MAX_SYSEX_DATA: usize = 1024;

/// Number of digital pins on the board
pub const TOTAL_PINS: u8 = 20;

/// Number of 8-pin digital ports
pub const PORT_COUNT: usize = (TOTAL_PINS as usize + 7) / 8;

/// Maximum length of a board name accepted by the renaming sub-protocol
pub const MAX_BOARD_NAME_LEN: usize = 14;
