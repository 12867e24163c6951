//! Shield frame encoding/decoding
//!
//! Frame format:
//! - 1 byte: start of frame (`0xFF`)
//! - 1 byte: shield id
//! - 1 byte: instance id
//! - 1 byte: function id
//! - 1 byte: argument count, followed by `255 - count`
//! - per argument: length, `255 - length`, then `length` bytes
//! - 1 byte: end of frame (`0x00`)
//!
//! Frames coming from the board carry one extra byte, the library version,
//! right after the start marker. That variant is reassembled by the stream
//! decoder, not here.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::{ProtocolError, END_OF_FRAME, MAX_ARGUMENTS, MAX_ARGUMENT_LEN, START_OF_FRAME};

/// One message addressed to or from a shield
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "FrameFields")]
pub struct ShieldFrame {
    /// Shield id
    pub shield_id: u8,
    /// Shield instance (0 unless the board hosts several instances)
    pub instance_id: u8,
    /// Function id within the shield
    pub function_id: u8,
    /// Arguments in insertion order, each 1..=255 bytes
    arguments: Vec<Vec<u8>>,
}

impl ShieldFrame {
    /// Create a frame with no arguments and instance 0
    pub fn new(shield_id: u8, function_id: u8) -> Self {
        Self {
            shield_id,
            instance_id: 0,
            function_id,
            arguments: Vec::new(),
        }
    }

    /// Create a frame for a specific shield instance
    pub fn with_instance(shield_id: u8, instance_id: u8, function_id: u8) -> Self {
        Self {
            shield_id,
            instance_id,
            function_id,
            arguments: Vec::new(),
        }
    }

    /// Add a raw argument, truncated to 255 bytes.
    ///
    /// Empty arguments cannot be represented on the wire and are skipped, as is
    /// anything beyond the 255th argument.
    pub fn add_bytes(&mut self, data: &[u8]) -> &mut Self {
        if data.is_empty() {
            tracing::debug!("skipping empty argument for shield {:#04x}", self.shield_id);
            return self;
        }
        if self.arguments.len() >= MAX_ARGUMENTS {
            tracing::warn!(
                "shield {:#04x} frame already holds {} arguments, dropping one",
                self.shield_id,
                MAX_ARGUMENTS
            );
            return self;
        }
        let len = data.len().min(MAX_ARGUMENT_LEN);
        self.arguments.push(data[..len].to_vec());
        self
    }

    /// Add a single byte argument
    pub fn add_byte(&mut self, value: u8) -> &mut Self {
        self.add_bytes(&[value])
    }

    /// Add a boolean argument (`0x01` / `0x00`)
    pub fn add_bool(&mut self, value: bool) -> &mut Self {
        self.add_byte(value as u8)
    }

    /// Add an unsigned integer using `width` little-endian bytes (1..=4).
    /// Bits that do not fit in `width` are dropped.
    pub fn add_int(&mut self, value: u32, width: usize) -> &mut Self {
        let width = width.clamp(1, 4);
        let mask = (1u64 << (8 * width)) - 1;
        let mut buf = [0u8; 4];
        LittleEndian::write_uint(&mut buf, value as u64 & mask, width);
        self.add_bytes(&buf[..width])
    }

    /// Add a 16-bit value (little-endian)
    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        self.add_int(value as u32, 2)
    }

    /// Add a 32-bit value (little-endian)
    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.add_int(value, 4)
    }

    /// Add a single-precision float (big-endian on the wire)
    pub fn add_float(&mut self, value: f32) -> &mut Self {
        let mut buf = [0u8; 4];
        BigEndian::write_f32(&mut buf, value);
        self.add_bytes(&buf)
    }

    /// Add a string argument, truncated to 255 bytes
    pub fn add_str(&mut self, value: &str) -> &mut Self {
        self.add_bytes(value.as_bytes())
    }

    /// All arguments in insertion order
    pub fn arguments(&self) -> &[Vec<u8>] {
        &self.arguments
    }

    /// Number of arguments
    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }

    /// Raw bytes of argument `index`
    pub fn argument(&self, index: usize) -> Option<&[u8]> {
        self.arguments.get(index).map(Vec::as_slice)
    }

    /// Interpret argument `index` as a boolean (any non-zero first byte)
    pub fn argument_as_bool(&self, index: usize) -> Option<bool> {
        self.argument(index)
            .and_then(|arg| arg.first())
            .map(|byte| *byte != 0)
    }

    /// Interpret argument `index` as a little-endian unsigned integer of 1..=4 bytes
    pub fn argument_as_int(&self, index: usize) -> Option<u32> {
        let arg = self.argument(index)?;
        if arg.len() > 4 {
            return None;
        }
        Some(LittleEndian::read_uint(arg, arg.len()) as u32)
    }

    /// Interpret argument `index` as a big-endian single-precision float
    pub fn argument_as_float(&self, index: usize) -> Option<f32> {
        let arg = self.argument(index)?;
        if arg.len() != 4 {
            return None;
        }
        Some(BigEndian::read_f32(arg))
    }

    /// Interpret argument `index` as text (lossy UTF-8)
    pub fn argument_as_string(&self, index: usize) -> Option<String> {
        self.argument(index)
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        7 + self
            .arguments
            .iter()
            .map(|arg| 2 + arg.len())
            .sum::<usize>()
    }

    /// Encode the frame to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.push(START_OF_FRAME);
        bytes.push(self.shield_id);
        bytes.push(self.instance_id);
        bytes.push(self.function_id);

        let count = self.arguments.len() as u8;
        bytes.push(count);
        bytes.push(255 - count);

        for arg in &self.arguments {
            let len = arg.len() as u8;
            bytes.push(len);
            bytes.push(255 - len);
            bytes.extend_from_slice(arg);
        }

        bytes.push(END_OF_FRAME);
        bytes
    }

    /// Decode a frame from raw bytes (the exact inverse of [`ShieldFrame::to_bytes`])
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(data);

        if reader.next()? != START_OF_FRAME {
            return Err(ProtocolError::InvalidFrame("missing start of frame"));
        }
        let shield_id = reader.next()?;
        let instance_id = reader.next()?;
        let function_id = reader.next()?;

        let count = reader.checked_byte()?;
        let mut arguments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = reader.checked_byte()?;
            if len == 0 {
                return Err(ProtocolError::InvalidFrame("zero-length argument"));
            }
            arguments.push(reader.take(len as usize)?.to_vec());
        }

        if reader.next()? != END_OF_FRAME {
            return Err(ProtocolError::InvalidFrame("missing end of frame"));
        }
        if !reader.is_empty() {
            return Err(ProtocolError::InvalidFrame("trailing bytes after end of frame"));
        }

        Ok(Self {
            shield_id,
            instance_id,
            function_id,
            arguments,
        })
    }
}

/// Deserialized form of [`ShieldFrame`], rebuilt through `add_bytes` so the
/// argument limits hold for frames loaded from JSON as well
#[derive(Deserialize)]
struct FrameFields {
    shield_id: u8,
    #[serde(default)]
    instance_id: u8,
    function_id: u8,
    #[serde(default)]
    arguments: Vec<Vec<u8>>,
}

impl From<FrameFields> for ShieldFrame {
    fn from(fields: FrameFields) -> Self {
        let mut frame = ShieldFrame::with_instance(
            fields.shield_id,
            fields.instance_id,
            fields.function_id,
        );
        for arg in &fields.arguments {
            frame.add_bytes(arg);
        }
        frame
    }
}

/// Check that `check` is the complement of `value`
pub(crate) fn verify_complement(value: u8, check: u8) -> Result<(), ProtocolError> {
    let expected = 255 - value;
    if check != expected {
        return Err(ProtocolError::ChecksumMismatch {
            expected,
            actual: check,
        });
    }
    Ok(())
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn next(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(ProtocolError::InvalidFrame("truncated frame"))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read a value followed by its complement check byte
    fn checked_byte(&mut self) -> Result<u8, ProtocolError> {
        let value = self.next()?;
        verify_complement(value, self.next()?)?;
        Ok(value)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + len > self.data.len() {
            return Err(ProtocolError::InvalidFrame("truncated argument"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}
