//! Inbound stream decoding
//!
//! Two layers recover messages from the raw byte stream:
//! - [`FirmataParser`] splits the stream into digital reports, version
//!   reports and sysex messages.
//! - [`FrameAssembler`] rebuilds shield frames from the serial payload
//!   carried by SERIAL_DATA sysex messages.
//!
//! Corrupt input never surfaces as an error: partial messages are dropped and
//! decoding resumes at the next recognizable boundary.

use std::time::Duration;
use tokio::time::Instant;

use super::frame::verify_complement;
use super::sysex::decode_7bit;
use super::{Command, ShieldFrame, SysexCommand, END_OF_FRAME, MAX_SYSEX_DATA, START_OF_FRAME};

/// Events produced by the firmware-level parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Current value of an 8-pin digital input port
    DigitalReport { port: u8, value: u8 },
    /// Firmware version report
    FirmwareVersion { major: u8, minor: u8 },
    /// Complete sysex message with its payload already recombined from 7-bit pairs
    Sysex { command: u8, data: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Idle,
    MultiByteWait { command: Command, channel: u8 },
    Sysex,
}

/// Byte-at-a-time parser for the firmware command stream
#[derive(Debug)]
pub struct FirmataParser {
    state: ParserState,
    stored: Vec<u8>,
    sysex: Vec<u8>,
}

impl Default for FirmataParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmataParser {
    /// Create a parser in the idle state
    pub fn new() -> Self {
        Self {
            state: ParserState::Idle,
            stored: Vec::with_capacity(2),
            sysex: Vec::new(),
        }
    }

    /// Consume one byte, returning an event once a message completes
    pub fn push(&mut self, byte: u8) -> Option<StreamEvent> {
        match self.state {
            ParserState::Sysex => self.push_sysex(byte),
            ParserState::MultiByteWait { command, channel } => {
                if byte & 0x80 != 0 {
                    tracing::trace!("command {:#04x} interrupted a pending message", byte);
                    return self.push_command(byte);
                }
                self.stored.push(byte);
                if self.stored.len() < 2 {
                    return None;
                }
                self.state = ParserState::Idle;
                let (first, second) = (self.stored[0], self.stored[1]);
                self.stored.clear();
                match command {
                    Command::DigitalMessage => Some(StreamEvent::DigitalReport {
                        port: channel,
                        value: (first & 0x7F) | (second << 7),
                    }),
                    Command::ReportVersion => Some(StreamEvent::FirmwareVersion {
                        major: first,
                        minor: second,
                    }),
                    _ => None,
                }
            }
            ParserState::Idle => {
                if byte & 0x80 != 0 {
                    self.push_command(byte)
                } else {
                    None
                }
            }
        }
    }

    fn push_command(&mut self, byte: u8) -> Option<StreamEvent> {
        self.stored.clear();
        self.state = if byte >= 0xF0 {
            match Command::from_full_byte(byte) {
                Some(Command::StartSysex) => {
                    self.sysex.clear();
                    ParserState::Sysex
                }
                Some(Command::ReportVersion) => ParserState::MultiByteWait {
                    command: Command::ReportVersion,
                    channel: 0,
                },
                _ => ParserState::Idle,
            }
        } else {
            match Command::from_high_nibble(byte) {
                Some(command @ (Command::DigitalMessage | Command::AnalogMessage)) => {
                    ParserState::MultiByteWait {
                        command,
                        channel: byte & 0x0F,
                    }
                }
                _ => ParserState::Idle,
            }
        };
        None
    }

    fn push_sysex(&mut self, byte: u8) -> Option<StreamEvent> {
        if byte == Command::EndSysex.byte() {
            self.state = ParserState::Idle;
            return self.finish_sysex();
        }
        if byte & 0x80 != 0 {
            tracing::debug!("dropping unterminated sysex ({} bytes)", self.sysex.len());
            self.sysex.clear();
            return self.push_command(byte);
        }
        if self.sysex.len() >= MAX_SYSEX_DATA {
            tracing::debug!("dropping oversized sysex");
            self.sysex.clear();
            self.state = ParserState::Idle;
            return None;
        }
        self.sysex.push(byte);
        None
    }

    fn finish_sysex(&mut self) -> Option<StreamEvent> {
        let buffer = std::mem::take(&mut self.sysex);
        let (&command, payload) = buffer.split_first()?;
        match decode_7bit(payload) {
            Ok(data) => Some(StreamEvent::Sysex { command, data }),
            Err(e) => {
                tracing::debug!("discarding sysex {:#04x}: {}", command, e);
                None
            }
        }
    }
}

/// A shield frame received from the board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Library version byte carried in every inbound frame header
    pub library_version: u8,
    /// The frame itself
    pub frame: ShieldFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblerState {
    AwaitStart,
    LibraryVersion,
    ShieldId,
    InstanceId,
    FunctionId,
    ArgCount,
    ArgCountCheck,
    ArgLen,
    ArgLenCheck,
    ArgData,
    AwaitEnd,
}

/// Rebuilds shield frames from the serial byte stream
#[derive(Debug)]
pub struct FrameAssembler {
    state: AssemblerState,
    deadline: Duration,
    started: Option<Instant>,
    library_version: u8,
    shield_id: u8,
    instance_id: u8,
    function_id: u8,
    arg_count: u8,
    arg_len: u8,
    arguments: Vec<Vec<u8>>,
    current: Vec<u8>,
}

impl FrameAssembler {
    /// Create an assembler that gives up on a partial frame after `deadline`
    pub fn new(deadline: Duration) -> Self {
        Self {
            state: AssemblerState::AwaitStart,
            deadline,
            started: None,
            library_version: 0,
            shield_id: 0,
            instance_id: 0,
            function_id: 0,
            arg_count: 0,
            arg_len: 0,
            arguments: Vec::new(),
            current: Vec::new(),
        }
    }

    /// Whether a frame is partially assembled
    pub fn in_progress(&self) -> bool {
        self.state != AssemblerState::AwaitStart
    }

    /// Instant at which the partial frame expires, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.started.map(|started| started + self.deadline)
    }

    /// Drop the partial frame because its remaining bytes never arrived
    pub fn expire(&mut self) {
        if self.in_progress() {
            tracing::debug!("partial frame for shield {:#04x} timed out", self.shield_id);
            self.reset();
        }
    }

    /// Consume one serial byte
    pub fn push(&mut self, byte: u8, now: Instant) -> Option<InboundFrame> {
        if self.deadline().is_some_and(|deadline| now >= deadline) {
            self.expire();
        }

        match self.state {
            AssemblerState::AwaitStart => {
                if byte == START_OF_FRAME {
                    self.begin(now);
                }
            }
            AssemblerState::LibraryVersion => {
                self.library_version = byte;
                self.state = AssemblerState::ShieldId;
            }
            AssemblerState::ShieldId => {
                self.shield_id = byte;
                self.state = AssemblerState::InstanceId;
            }
            AssemblerState::InstanceId => {
                self.instance_id = byte;
                self.state = AssemblerState::FunctionId;
            }
            AssemblerState::FunctionId => {
                self.function_id = byte;
                self.state = AssemblerState::ArgCount;
            }
            AssemblerState::ArgCount => {
                self.arg_count = byte;
                self.state = AssemblerState::ArgCountCheck;
            }
            AssemblerState::ArgCountCheck => {
                if verify_complement(self.arg_count, byte).is_err() {
                    self.resync(byte, now, "argument count check mismatch");
                } else if self.arg_count == 0 {
                    self.state = AssemblerState::AwaitEnd;
                } else {
                    self.state = AssemblerState::ArgLen;
                }
            }
            AssemblerState::ArgLen => {
                if byte == 0 {
                    self.resync(byte, now, "zero-length argument");
                } else {
                    self.arg_len = byte;
                    self.state = AssemblerState::ArgLenCheck;
                }
            }
            AssemblerState::ArgLenCheck => {
                if verify_complement(self.arg_len, byte).is_err() {
                    self.resync(byte, now, "argument length check mismatch");
                } else {
                    self.current = Vec::with_capacity(self.arg_len as usize);
                    self.state = AssemblerState::ArgData;
                }
            }
            AssemblerState::ArgData => {
                self.current.push(byte);
                if self.current.len() == self.arg_len as usize {
                    self.arguments.push(std::mem::take(&mut self.current));
                    self.state = if self.arguments.len() == self.arg_count as usize {
                        AssemblerState::AwaitEnd
                    } else {
                        AssemblerState::ArgLen
                    };
                }
            }
            AssemblerState::AwaitEnd => {
                if byte == END_OF_FRAME {
                    return Some(self.complete());
                }
                self.resync(byte, now, "missing end of frame");
            }
        }
        None
    }

    fn begin(&mut self, now: Instant) {
        self.reset();
        self.started = Some(now);
        self.state = AssemblerState::LibraryVersion;
    }

    /// Abandon the partial frame. A start marker in the offending position
    /// opens the next frame right away.
    fn resync(&mut self, byte: u8, now: Instant, reason: &str) {
        tracing::debug!(
            "resynchronizing after {} (shield {:#04x}, function {:#04x})",
            reason,
            self.shield_id,
            self.function_id
        );
        self.reset();
        if byte == START_OF_FRAME {
            self.begin(now);
        }
    }

    fn complete(&mut self) -> InboundFrame {
        let mut frame =
            ShieldFrame::with_instance(self.shield_id, self.instance_id, self.function_id);
        for arg in &self.arguments {
            frame.add_bytes(arg);
        }
        let inbound = InboundFrame {
            library_version: self.library_version,
            frame,
        };
        self.reset();
        inbound
    }

    fn reset(&mut self) {
        self.state = AssemblerState::AwaitStart;
        self.started = None;
        self.arguments.clear();
        self.current.clear();
        self.arg_count = 0;
        self.arg_len = 0;
    }
}

/// Events produced by [`StreamDecoder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    /// Digital input port report
    DigitalReport { port: u8, value: u8 },
    /// Firmware version report
    FirmwareVersion { major: u8, minor: u8 },
    /// Raw serial passthrough bytes
    SerialData(Vec<u8>),
    /// Reassembled shield frame
    Frame(InboundFrame),
    /// Any sysex other than serial passthrough
    Sysex { command: u8, data: Vec<u8> },
}

/// Both decoding layers wired together
#[derive(Debug)]
pub struct StreamDecoder {
    parser: FirmataParser,
    assembler: FrameAssembler,
}

impl StreamDecoder {
    /// Create a decoder whose frame layer uses `frame_deadline`
    pub fn new(frame_deadline: Duration) -> Self {
        Self {
            parser: FirmataParser::new(),
            assembler: FrameAssembler::new(frame_deadline),
        }
    }

    /// Decode a chunk of inbound bytes
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        for &byte in bytes {
            let Some(event) = self.parser.push(byte) else {
                continue;
            };
            match event {
                StreamEvent::DigitalReport { port, value } => {
                    events.push(DecodedEvent::DigitalReport { port, value });
                }
                StreamEvent::FirmwareVersion { major, minor } => {
                    events.push(DecodedEvent::FirmwareVersion { major, minor });
                }
                StreamEvent::Sysex { command, data }
                    if command == SysexCommand::SerialData.byte() =>
                {
                    for &serial_byte in &data {
                        if let Some(frame) = self.assembler.push(serial_byte, now) {
                            events.push(DecodedEvent::Frame(frame));
                        }
                    }
                    events.push(DecodedEvent::SerialData(data));
                }
                StreamEvent::Sysex { command, data } => {
                    events.push(DecodedEvent::Sysex { command, data });
                }
            }
        }
        events
    }

    /// Deadline of the partially assembled frame, if any
    pub fn frame_deadline(&self) -> Option<Instant> {
        self.assembler.deadline()
    }

    /// Drop a partial frame whose deadline passed
    pub fn expire_partial_frame(&mut self) {
        self.assembler.expire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sysex::build_serial_data;
    use pretty_assertions::assert_eq;

    fn inbound_bytes(library_version: u8, frame: &ShieldFrame) -> Vec<u8> {
        let mut bytes = frame.to_bytes();
        bytes.insert(1, library_version);
        bytes
    }

    fn feed_all(assembler: &mut FrameAssembler, bytes: &[u8]) -> Vec<InboundFrame> {
        let now = Instant::now();
        bytes
            .iter()
            .filter_map(|b| assembler.push(*b, now))
            .collect()
    }

    #[test]
    fn test_digital_report() {
        let mut parser = FirmataParser::new();
        assert_eq!(parser.push(0x91), None);
        assert_eq!(parser.push(0x7F), None);
        assert_eq!(
            parser.push(0x01),
            Some(StreamEvent::DigitalReport { port: 1, value: 0xFF })
        );
    }

    #[test]
    fn test_version_report() {
        let mut parser = FirmataParser::new();
        let events: Vec<_> = [0xF9, 0x02, 0x05]
            .iter()
            .filter_map(|b| parser.push(*b))
            .collect();
        assert_eq!(events, vec![StreamEvent::FirmwareVersion { major: 2, minor: 5 }]);
    }

    #[test]
    fn test_analog_message_ignored() {
        let mut parser = FirmataParser::new();
        let events: Vec<_> = [0xE3, 0x10, 0x01, 0x90, 0x01, 0x00]
            .iter()
            .filter_map(|b| parser.push(*b))
            .collect();
        assert_eq!(events, vec![StreamEvent::DigitalReport { port: 0, value: 1 }]);
    }

    #[test]
    fn test_sysex_decoded() {
        let mut parser = FirmataParser::new();
        let events: Vec<_> = [0xF0, 0x62, 0x7F, 0x01, 0xF7]
            .iter()
            .filter_map(|b| parser.push(*b))
            .collect();
        assert_eq!(
            events,
            vec![StreamEvent::Sysex {
                command: 0x62,
                data: vec![0xFF]
            }]
        );
    }

    #[test]
    fn test_odd_sysex_discarded() {
        let mut parser = FirmataParser::new();
        let events: Vec<_> = [0xF0, 0x66, 0x01, 0x00, 0x05, 0xF7, 0x90, 0x00, 0x00]
            .iter()
            .filter_map(|b| parser.push(*b))
            .collect();
        assert_eq!(events, vec![StreamEvent::DigitalReport { port: 0, value: 0 }]);
    }

    #[test]
    fn test_interrupted_message_reprocessed() {
        let mut parser = FirmataParser::new();
        let events: Vec<_> = [0x90, 0x01, 0xF9, 0x01, 0x02]
            .iter()
            .filter_map(|b| parser.push(*b))
            .collect();
        assert_eq!(events, vec![StreamEvent::FirmwareVersion { major: 1, minor: 2 }]);
    }

    #[test]
    fn test_frame_reassembly() {
        let mut frame = ShieldFrame::new(0x0A, 0x02);
        frame.add_str("hi").add_byte(9);
        let mut assembler = FrameAssembler::new(Duration::from_secs(1));
        let frames = feed_all(&mut assembler, &inbound_bytes(7, &frame));
        assert_eq!(
            frames,
            vec![InboundFrame {
                library_version: 7,
                frame
            }]
        );
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_corrupt_length_check_resyncs() {
        let mut bad = ShieldFrame::new(0x0A, 0x02);
        bad.add_bytes(&[1, 2, 3]);
        let mut corrupted = inbound_bytes(1, &bad);
        // argument length check byte
        corrupted[8] ^= 0x04;

        let mut good = ShieldFrame::new(0x0B, 0x03);
        good.add_bool(true);

        let mut stream = vec![0x13, 0x37];
        stream.extend(corrupted);
        stream.extend(inbound_bytes(1, &good));

        let mut assembler = FrameAssembler::new(Duration::from_secs(1));
        let frames = feed_all(&mut assembler, &stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, good);
    }

    #[test]
    fn test_zero_length_argument_resyncs() {
        let stream = [0xFF, 1, 0x0A, 0, 0x02, 1, 0xFE, 0, 0x05, 0x00];
        let mut assembler = FrameAssembler::new(Duration::from_secs(1));
        assert!(feed_all(&mut assembler, &stream).is_empty());
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_missing_end_starts_next_frame() {
        let mut frame = ShieldFrame::new(0x0C, 0x01);
        frame.add_byte(1);
        let mut truncated = inbound_bytes(1, &frame);
        truncated.pop();
        let mut stream = truncated;
        stream.extend(inbound_bytes(1, &frame));

        let mut assembler = FrameAssembler::new(Duration::from_secs(1));
        let frames = feed_all(&mut assembler, &stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, frame);
    }

    #[test]
    fn test_deadline_discards_partial_frame() {
        let mut frame = ShieldFrame::new(0x0C, 0x01);
        frame.add_byte(1);
        let bytes = inbound_bytes(1, &frame);
        let (head, tail) = bytes.split_at(5);

        let start = Instant::now();
        let mut assembler = FrameAssembler::new(Duration::from_millis(100));
        for b in head {
            assert!(assembler.push(*b, start).is_none());
        }
        assert_eq!(assembler.deadline(), Some(start + Duration::from_millis(100)));

        let late = start + Duration::from_millis(150);
        let frames: Vec<_> = tail.iter().filter_map(|b| assembler.push(*b, late)).collect();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_stream_decoder_end_to_end() {
        let mut frame = ShieldFrame::new(0x20, 0x04);
        frame.add_u16(513).add_str("a longer argument spanning chunks");
        let serial = inbound_bytes(3, &frame);

        let mut stream = vec![0x92, 0x05, 0x00];
        for message in build_serial_data(&serial) {
            stream.extend(message);
        }
        stream.extend([0xF0, 0x62, 0xF7]);

        let mut decoder = StreamDecoder::new(Duration::from_secs(1));
        let events = decoder.feed(&stream, Instant::now());

        assert_eq!(events[0], DecodedEvent::DigitalReport { port: 2, value: 5 });
        let frames: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DecodedEvent::Frame(f) => Some(f.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, frame);
        assert_eq!(frames[0].library_version, 3);
        assert_eq!(
            events.last(),
            Some(&DecodedEvent::Sysex {
                command: 0x62,
                data: vec![]
            })
        );
    }
}
