use std::time::Duration;

use pretty_assertions::assert_eq;
use sheeldlink_core::protocol::sysex::build_serial_data;
use sheeldlink_core::protocol::{
    build_sysex, DecodedEvent, InboundFrame, OperationError, ProtocolError, ShieldFrame,
    StreamDecoder, SysexCommand,
};
use tokio::time::Instant;

/// What a board would put on the wire for `frame`
fn board_bytes(frame: &ShieldFrame, library_version: u8) -> Vec<u8> {
    let mut raw = frame.to_bytes();
    raw.insert(1, library_version);
    build_serial_data(&raw).concat()
}

fn frames(events: Vec<DecodedEvent>) -> Vec<ShieldFrame> {
    events
        .into_iter()
        .filter_map(|e| match e {
            DecodedEvent::Frame(InboundFrame { frame, .. }) => Some(frame),
            _ => None,
        })
        .collect()
}

#[test]
fn test_single_byte_argument_wire_format() {
    let mut frame = ShieldFrame::new(0x75, 0x01);
    frame.add_byte(0x01);
    assert_eq!(
        frame.to_bytes(),
        vec![0xFF, 0x75, 0x00, 0x01, 0x01, 0xFE, 0x01, 0xFE, 0x01, 0x00]
    );
    assert_eq!(ShieldFrame::from_bytes(&frame.to_bytes()).unwrap(), frame);
}

#[test]
fn test_maximum_argument_count_survives_the_wire() {
    let mut frame = ShieldFrame::with_instance(0x30, 1, 0x07);
    for n in 0..=255u8 {
        frame.add_byte(n);
    }
    assert_eq!(frame.argument_count(), 255);

    let bytes = frame.to_bytes();
    assert_eq!(bytes[4], 255);
    assert_eq!(bytes[5], 0);
    assert_eq!(ShieldFrame::from_bytes(&bytes).unwrap(), frame);

    let mut decoder = StreamDecoder::new(Duration::from_secs(1));
    let decoded = frames(decoder.feed(&board_bytes(&frame, 3), Instant::now()));
    assert_eq!(decoded, vec![frame]);
}

#[test]
fn test_corrupted_check_byte_rejected() {
    let mut frame = ShieldFrame::new(0x75, 0x01);
    frame.add_byte(0x01);
    let mut bytes = frame.to_bytes();
    bytes[7] = 0xFD;

    assert!(matches!(
        ShieldFrame::from_bytes(&bytes),
        Err(ProtocolError::ChecksumMismatch {
            expected: 0xFE,
            actual: 0xFD
        })
    ));
}

#[test]
fn test_decoder_recovers_after_corruption() {
    let mut first = ShieldFrame::new(0x30, 0x01);
    first.add_str("first");
    let mut second = ShieldFrame::new(0x31, 0x02);
    second.add_u16(0x1234);

    let mut corrupted = first.to_bytes();
    corrupted.insert(1, 1);
    corrupted[7] ^= 0x0F;

    let mut raw = corrupted;
    let mut good = second.to_bytes();
    good.insert(1, 1);
    raw.extend_from_slice(&good);

    let mut decoder = StreamDecoder::new(Duration::from_secs(1));
    let decoded = frames(decoder.feed(&build_serial_data(&raw).concat(), Instant::now()));
    assert_eq!(decoded, vec![second]);
}

#[test]
fn test_frames_split_across_reads() {
    let mut frame = ShieldFrame::new(0x40, 0x03);
    frame.add_str("split me across reads").add_float(1.5);
    let bytes = board_bytes(&frame, 2);

    let mut decoder = StreamDecoder::new(Duration::from_secs(1));
    let now = Instant::now();
    let mut decoded = Vec::new();
    for piece in bytes.chunks(5) {
        decoded.extend(frames(decoder.feed(piece, now)));
    }
    assert_eq!(decoded, vec![frame]);
}

#[test]
fn test_mixed_board_transcript() {
    let mut version = ShieldFrame::new(0x00, 0x01);
    version.add_byte(9);

    let mut stream = vec![0xF9, 1, 5];
    stream.extend([0x91, 0x03, 0x00]);
    stream.extend(board_bytes(&version, 9));
    stream.extend(build_sysex(SysexCommand::IsAlive, &[]).unwrap());

    let mut decoder = StreamDecoder::new(Duration::from_secs(1));
    let events: Vec<DecodedEvent> = decoder
        .feed(&stream, Instant::now())
        .into_iter()
        .filter(|e| !matches!(e, DecodedEvent::SerialData(_)))
        .collect();

    assert_eq!(
        events,
        vec![
            DecodedEvent::FirmwareVersion { major: 1, minor: 5 },
            DecodedEvent::DigitalReport { port: 1, value: 3 },
            DecodedEvent::Frame(InboundFrame {
                library_version: 9,
                frame: version,
            }),
            DecodedEvent::Sysex {
                command: 0x62,
                data: Vec::new()
            },
        ]
    );
}

#[test]
fn test_sysex_payload_limit() {
    assert!(build_sysex(SysexCommand::SerialData, &[0u8; 16]).is_ok());
    assert!(matches!(
        build_sysex(SysexCommand::SerialData, &[0u8; 17]),
        Err(ProtocolError::SysexTooLong(34))
    ));

    // Long payloads are split instead
    let messages = build_serial_data(&[0xAB; 100]);
    assert_eq!(messages.len(), 8);
    assert!(messages.iter().all(|m| m.len() - 3 <= 32));
}

#[test]
fn test_error_messages() {
    assert_eq!(
        ProtocolError::PinOutOfRange { pin: 25, count: 20 }.to_string(),
        "Pin 25 out of range (0..20)"
    );
    assert_eq!(
        OperationError::CapacityReached(7).to_string(),
        "Maximum of 7 connected devices reached"
    );
    assert_eq!(
        OperationError::ConnectionFailed {
            address: "AA".into(),
            reason: "refused".into()
        }
        .to_string(),
        "Connection to AA failed: refused"
    );
}
