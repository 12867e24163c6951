//! Sysex and firmware command building
//!
//! Sysex data bytes must keep bit 7 clear, so every payload byte travels as
//! two 7-bit bytes: the low seven bits, then the remaining bit.

use super::{Command, ProtocolError, SysexCommand, MAX_FRAME_CHUNK, MAX_SYSEX_PAYLOAD};

/// Split every byte into two 7-bit bytes
pub fn encode_7bit(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() * 2);
    for byte in data {
        encoded.push(byte & 0x7F);
        encoded.push((byte >> 7) & 0x7F);
    }
    encoded
}

/// Recombine 7-bit pairs into bytes. Odd input cannot be paired and is rejected.
pub fn decode_7bit(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if data.len() % 2 != 0 {
        return Err(ProtocolError::OddSysexLength(data.len()));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| (pair[0] & 0x7F) | (pair[1] << 7))
        .collect())
}

/// Build a complete sysex message: `F0 command encoded-payload F7`.
///
/// The encoded payload may not exceed [`MAX_SYSEX_PAYLOAD`] bytes.
pub fn build_sysex(command: SysexCommand, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let encoded_len = data.len() * 2;
    if encoded_len > MAX_SYSEX_PAYLOAD {
        return Err(ProtocolError::SysexTooLong(encoded_len));
    }

    let mut message = Vec::with_capacity(encoded_len + 3);
    message.push(Command::StartSysex.byte());
    message.push(command.byte());
    message.extend(encode_7bit(data));
    message.push(Command::EndSysex.byte());
    Ok(message)
}

/// Wrap arbitrary serial bytes in as many SERIAL_DATA sysex messages as needed
pub fn build_serial_data(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(MAX_FRAME_CHUNK)
        .filter_map(|chunk| build_sysex(SysexCommand::SerialData, chunk).ok())
        .collect()
}

/// Build a digital port write (`0x90|port lsb msb`)
pub fn digital_port_message(port: u8, value: u8) -> Vec<u8> {
    vec![
        Command::DigitalMessage.with_channel(port),
        value & 0x7F,
        (value >> 7) & 0x7F,
    ]
}

/// Build an analog (PWM) write (`0xE0|pin lsb msb`)
pub fn analog_message(pin: u8, value: u8) -> Vec<u8> {
    vec![
        Command::AnalogMessage.with_channel(pin),
        value & 0x7F,
        (value >> 7) & 0x7F,
    ]
}

/// Build a digital report toggle for one port
pub fn report_digital_message(port: u8, enabled: bool) -> Vec<u8> {
    vec![Command::ReportDigital.with_channel(port), enabled as u8]
}

/// Build a pin mode change
pub fn pin_mode_message(pin: u8, mode: u8) -> Vec<u8> {
    vec![Command::SetPinMode.byte(), pin, mode]
}
