//! Integration tests for the wire format.

use std::io::Cursor;
use vigil_core::codec::{
    decode_message, encode_message, ChannelMessage, PartResultKind, TestPartResult, TestProperty,
};

fn part(kind: PartResultKind, file: Option<&str>, line: i32, message: Option<&str>) -> TestPartResult {
    TestPartResult::new(
        kind,
        file.map(str::to_string),
        line,
        message.map(str::to_string),
    )
}

#[test]
fn test_result_roundtrip_matrix() {
    let kinds = [
        PartResultKind::Success,
        PartResultKind::NonFatalFailure,
        PartResultKind::FatalFailure,
    ];
    let files = [None, Some("src/widget.rs"), Some("")];
    let messages = [
        None,
        Some("plain"),
        Some("with |pipes| and 'A' ack bytes"),
        Some("multi\nline\nand\ttabs"),
    ];

    for kind in kinds {
        for file in files {
            for message in messages {
                let original = part(kind, file, -1, message);
                let bytes = encode_message(&ChannelMessage::PartResult(original.clone()));
                let decoded = decode_message(&mut Cursor::new(bytes)).unwrap().unwrap();
                assert_eq!(decoded, ChannelMessage::PartResult(original));
            }
        }
    }
}

#[test]
fn test_message_sequence_decodes_in_emission_order() {
    let messages = vec![
        ChannelMessage::Property(TestProperty {
            key: "build".to_string(),
            value: "1204".to_string(),
        }),
        ChannelMessage::PartResult(part(
            PartResultKind::NonFatalFailure,
            Some("a.rs"),
            10,
            Some("first"),
        )),
        ChannelMessage::PartResult(part(
            PartResultKind::FatalFailure,
            Some("b.rs"),
            20,
            Some("second"),
        )),
        ChannelMessage::ClearResults,
        ChannelMessage::PartResult(part(PartResultKind::Success, None, -1, Some("third"))),
        ChannelMessage::Exited,
    ];

    let mut stream = Vec::new();
    for message in &messages {
        stream.extend_from_slice(&encode_message(message));
    }

    let mut cursor = Cursor::new(stream);
    let mut decoded = Vec::new();
    while let Some(message) = decode_message(&mut cursor).unwrap() {
        decoded.push(message);
    }
    assert_eq!(decoded, messages);
}

#[test]
fn test_large_message_roundtrip() {
    let big = "x".repeat(1024 * 1024);
    let original = ChannelMessage::PartResult(part(
        PartResultKind::FatalFailure,
        Some("big.rs"),
        1,
        Some(&big),
    ));
    let bytes = encode_message(&original);
    let decoded = decode_message(&mut Cursor::new(bytes)).unwrap().unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn test_truncated_stream_fails_loudly() {
    let bytes = encode_message(&ChannelMessage::Property(TestProperty {
        key: "key".to_string(),
        value: "value".to_string(),
    }));
    // Every possible truncation point inside the message is a hard
    // error, not a partial decode.
    for cut in 1..bytes.len() {
        let mut cursor = Cursor::new(bytes[..cut].to_vec());
        assert!(
            decode_message(&mut cursor).is_err(),
            "cut at {} decoded anyway",
            cut
        );
    }
}

#[test]
fn test_line_number_extremes() {
    for line in [i32::MIN, -1, 0, i32::MAX] {
        let original = ChannelMessage::PartResult(part(
            PartResultKind::NonFatalFailure,
            Some("line.rs"),
            line,
            None,
        ));
        let bytes = encode_message(&original);
        let decoded = decode_message(&mut Cursor::new(bytes)).unwrap().unwrap();
        assert_eq!(decoded, original);
    }
}
