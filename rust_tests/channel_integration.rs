//! Integration tests for the pipe transport with the wire format on
//! top, single process, reader and writer on separate threads.

#![cfg(unix)]

use std::io::Read;
use std::thread;
use vigil_core::channel::channel;
use vigil_core::codec::{
    decode_message, encode_message, ChannelMessage, PartResultKind, TestPartResult,
};

#[test]
fn test_messages_cross_the_pipe_in_order() {
    let (mut read_end, write_end) = channel().unwrap();

    let sent: Vec<ChannelMessage> = (0..50)
        .map(|i| {
            ChannelMessage::PartResult(TestPartResult::new(
                PartResultKind::NonFatalFailure,
                Some(format!("file_{i}.rs")),
                i,
                Some(format!("failure number {i}")),
            ))
        })
        .chain(std::iter::once(ChannelMessage::Exited))
        .collect();

    let expected = sent.clone();
    let writer = thread::spawn(move || {
        for message in &sent {
            write_end.write_all_retry(&encode_message(message)).unwrap();
        }
        // write_end drops here, so the reader sees EOF after the
        // exit marker.
    });

    let mut received = Vec::new();
    while let Some(message) = decode_message(&mut read_end).unwrap() {
        received.push(message);
    }
    writer.join().unwrap();
    assert_eq!(received, expected);
}

#[test]
fn test_reader_sees_eof_when_writer_dies_mid_suite() {
    let (mut read_end, write_end) = channel().unwrap();

    let message = ChannelMessage::PartResult(TestPartResult::new(
        PartResultKind::Success,
        None,
        -1,
        Some("only one".to_string()),
    ));
    write_end
        .write_all_retry(&encode_message(&message))
        .unwrap();
    // No exit marker: the writer just goes away.
    drop(write_end);

    assert_eq!(decode_message(&mut read_end).unwrap(), Some(message));
    assert_eq!(decode_message(&mut read_end).unwrap(), None);
}

#[test]
fn test_partial_message_then_eof_is_an_error() {
    let (mut read_end, write_end) = channel().unwrap();

    let bytes = encode_message(&ChannelMessage::PartResult(TestPartResult::new(
        PartResultKind::FatalFailure,
        Some("half.rs".to_string()),
        3,
        Some("interrupted".to_string()),
    )));
    write_end.write_all_retry(&bytes[..bytes.len() / 2]).unwrap();
    drop(write_end);

    assert!(decode_message(&mut read_end).is_err());
}

#[test]
fn test_byte_stream_is_not_resegmented() {
    // One message written in tiny chunks still decodes as a whole.
    let (mut read_end, write_end) = channel().unwrap();
    let message = ChannelMessage::PartResult(TestPartResult::new(
        PartResultKind::NonFatalFailure,
        Some("chunked.rs".to_string()),
        9,
        Some("dribbled across many writes".to_string()),
    ));
    let bytes = encode_message(&message);

    let writer = thread::spawn(move || {
        for chunk in bytes.chunks(3) {
            write_end.write_all_retry(chunk).unwrap();
        }
    });

    assert_eq!(decode_message(&mut read_end).unwrap(), Some(message));
    writer.join().unwrap();

    let mut rest = Vec::new();
    read_end.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}
