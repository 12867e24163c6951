//! Digital pin state, tracked per 8-pin port

use crate::protocol::{ProtocolError, PORT_COUNT, TOTAL_PINS};

/// Analog writes address the pin through the low nibble of the command byte
pub const ANALOG_CHANNELS: u8 = 16;

/// Check a pin index against the board's pin count
pub fn validate_pin(pin: u8) -> Result<(), ProtocolError> {
    if pin >= TOTAL_PINS {
        return Err(ProtocolError::PinOutOfRange {
            pin,
            count: TOTAL_PINS,
        });
    }
    Ok(())
}

/// Check a pin index against the channels an analog write can address
pub fn validate_analog_pin(pin: u8) -> Result<(), ProtocolError> {
    validate_pin(pin)?;
    if pin >= ANALOG_CHANNELS {
        return Err(ProtocolError::PinOutOfRange {
            pin,
            count: ANALOG_CHANNELS,
        });
    }
    Ok(())
}

fn locate(pin: u8) -> (usize, u8) {
    ((pin / 8) as usize, 1 << (pin % 8))
}

/// Input and output bit vectors for every port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinState {
    inputs: [u8; PORT_COUNT],
    outputs: [u8; PORT_COUNT],
}

impl PinState {
    /// Flip one output bit, returning the port and its new value
    pub fn set_output(&mut self, pin: u8, high: bool) -> (u8, u8) {
        let (port, mask) = locate(pin);
        if high {
            self.outputs[port] |= mask;
        } else {
            self.outputs[port] &= !mask;
        }
        (port as u8, self.outputs[port])
    }

    /// Last reported input level of a pin
    pub fn input(&self, pin: u8) -> bool {
        let (port, mask) = locate(pin);
        self.inputs[port] & mask != 0
    }

    /// Current output value of a port
    pub fn output_port(&self, port: u8) -> Option<u8> {
        self.outputs.get(port as usize).copied()
    }

    /// Store a port report, returning `(pin, level)` for every pin that changed
    pub fn apply_report(&mut self, port: u8, value: u8) -> Vec<(u8, bool)> {
        let Some(current) = self.inputs.get_mut(port as usize) else {
            tracing::debug!("ignoring report for unknown port {}", port);
            return Vec::new();
        };
        let changed = *current ^ value;
        *current = value;

        (0..8u8)
            .filter(|bit| changed & (1 << bit) != 0)
            .map(|bit| (port * 8 + bit, value & (1 << bit) != 0))
            .filter(|(pin, _)| *pin < TOTAL_PINS)
            .collect()
    }
}
