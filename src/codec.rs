//! Binary wire format for overseer <-> executor messages.
//!
//! Messages are a one-byte tag followed by a type-specific payload.
//! Strings are length-prefixed instead of delimited because a result
//! message can contain any byte, including would-be delimiters.

use anyhow::{bail, Context, Result};
use std::io::{self, Read};

// Message tags
pub const TAG_RESULT: u8 = b'R';
pub const TAG_PROPERTY: u8 = b'P';
pub const TAG_CLEAR: u8 = b'C';
pub const TAG_EXIT: u8 = b'E';
pub const TAG_INTERNAL_ERROR: u8 = b'I';

/// Acknowledgement byte written by the overseer after applying a
/// synchronous message.
pub const ACK: u8 = b'A';

// Kind tags inside a result payload
const KIND_SUCCESS: u8 = b'S';
const KIND_NON_FATAL: u8 = b'N';
const KIND_FATAL: u8 = b'F';

/// Upper bound for a single encoded string. A length above this is a
/// corrupt stream, not a real message.
const MAX_STRING_LEN: u32 = 16 * 1024 * 1024;

/// Classification of a single reported check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartResultKind {
    Success,
    NonFatalFailure,
    FatalFailure,
}

impl PartResultKind {
    fn as_byte(self) -> u8 {
        match self {
            PartResultKind::Success => KIND_SUCCESS,
            PartResultKind::NonFatalFailure => KIND_NON_FATAL,
            PartResultKind::FatalFailure => KIND_FATAL,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            KIND_SUCCESS => Ok(PartResultKind::Success),
            KIND_NON_FATAL => Ok(PartResultKind::NonFatalFailure),
            KIND_FATAL => Ok(PartResultKind::FatalFailure),
            other => bail!("unknown test part result kind 0x{:02x}", other),
        }
    }

    pub fn is_failure(self) -> bool {
        !matches!(self, PartResultKind::Success)
    }
}

/// One check outcome, as observed in the executing process. Travels
/// executor -> overseer unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPartResult {
    pub kind: PartResultKind,
    pub file: Option<String>,
    pub line: i32,
    pub message: Option<String>,
}

impl TestPartResult {
    pub fn new(
        kind: PartResultKind,
        file: Option<String>,
        line: i32,
        message: Option<String>,
    ) -> Self {
        Self {
            kind,
            file,
            line,
            message,
        }
    }

    /// A fatal failure with no source position, used when the failure
    /// cannot be pinned to a line in the test body.
    pub fn fatal_at_unknown_location(message: String) -> Self {
        Self {
            kind: PartResultKind::FatalFailure,
            file: None,
            line: -1,
            message: Some(message),
        }
    }
}

/// A key/value pair recorded by the test body, executor -> overseer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestProperty {
    pub key: String,
    pub value: String,
}

/// Everything that can cross the channel, tagged on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    PartResult(TestPartResult),
    Property(TestProperty),
    ClearResults,
    Exited,
    InternalError(String),
}

// =============================================================================
// Encoding
// =============================================================================

/// `[presence:1][len:4 native][bytes]`, or a single zero byte for an
/// absent string.
fn encode_string(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(s) => {
            out.push(1);
            out.extend_from_slice(&(s.len() as u32).to_ne_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        None => out.push(0),
    }
}

fn encode_part_result(out: &mut Vec<u8>, result: &TestPartResult) {
    out.push(result.kind.as_byte());
    encode_string(out, result.file.as_deref());
    out.extend_from_slice(&result.line.to_ne_bytes());
    encode_string(out, result.message.as_deref());
}

/// Serializes a message, tag byte included.
pub fn encode_message(message: &ChannelMessage) -> Vec<u8> {
    let mut out = Vec::new();
    match message {
        ChannelMessage::PartResult(result) => {
            out.push(TAG_RESULT);
            encode_part_result(&mut out, result);
        }
        ChannelMessage::Property(property) => {
            out.push(TAG_PROPERTY);
            encode_string(&mut out, Some(&property.key));
            encode_string(&mut out, Some(&property.value));
        }
        ChannelMessage::ClearResults => out.push(TAG_CLEAR),
        ChannelMessage::Exited => out.push(TAG_EXIT),
        ChannelMessage::InternalError(message) => {
            out.push(TAG_INTERNAL_ERROR);
            encode_string(&mut out, Some(message));
        }
    }
    out
}

// =============================================================================
// Decoding
// =============================================================================

/// Reads the next tag byte. `Ok(None)` means the stream hit EOF on the
/// message boundary; an `Err` is a hard read error on the boundary.
/// Both are the caller's business to interpret.
pub fn read_tag(reader: &mut impl Read) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

fn decode_string(reader: &mut impl Read) -> Result<Option<String>> {
    let mut presence = [0u8; 1];
    reader
        .read_exact(&mut presence)
        .context("short read on string presence flag")?;
    if presence[0] == 0 {
        return Ok(None);
    }
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .context("short read on string length")?;
    let len = u32::from_ne_bytes(len_bytes);
    if len > MAX_STRING_LEN {
        bail!("string length {} exceeds protocol limit", len);
    }
    let mut bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut bytes)
        .context("short read on string contents")?;
    let text = String::from_utf8(bytes).context("string contents are not valid UTF-8")?;
    Ok(Some(text))
}

fn decode_part_result(reader: &mut impl Read) -> Result<TestPartResult> {
    let mut kind_byte = [0u8; 1];
    reader
        .read_exact(&mut kind_byte)
        .context("short read on result kind")?;
    let kind = PartResultKind::from_byte(kind_byte[0])?;
    let file = decode_string(reader).context("bad result file name")?;
    let mut line_bytes = [0u8; 4];
    reader
        .read_exact(&mut line_bytes)
        .context("short read on result line number")?;
    let line = i32::from_ne_bytes(line_bytes);
    let message = decode_string(reader).context("bad result message")?;
    Ok(TestPartResult {
        kind,
        file,
        line,
        message,
    })
}

/// Decodes the payload that follows `tag`. Unknown tags and short
/// reads are hard errors; the stream cannot be resynchronized after
/// either.
pub fn decode_payload(tag: u8, reader: &mut impl Read) -> Result<ChannelMessage> {
    match tag {
        TAG_RESULT => Ok(ChannelMessage::PartResult(decode_part_result(reader)?)),
        TAG_PROPERTY => {
            let key = decode_string(reader)
                .context("bad property key")?
                .context("property key is absent")?;
            let value = decode_string(reader)
                .context("bad property value")?
                .context("property value is absent")?;
            Ok(ChannelMessage::Property(TestProperty { key, value }))
        }
        TAG_CLEAR => Ok(ChannelMessage::ClearResults),
        TAG_EXIT => Ok(ChannelMessage::Exited),
        TAG_INTERNAL_ERROR => {
            let message = decode_string(reader)
                .context("bad internal error payload")?
                .context("internal error message is absent")?;
            Ok(ChannelMessage::InternalError(message))
        }
        other => bail!("unexpected status byte ({})", other),
    }
}

/// Reads one whole message. `Ok(None)` on EOF at a message boundary.
pub fn decode_message(reader: &mut impl Read) -> Result<Option<ChannelMessage>> {
    match read_tag(reader).context("read from channel failed")? {
        None => Ok(None),
        Some(tag) => Ok(Some(decode_payload(tag, reader)?)),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: ChannelMessage) -> ChannelMessage {
        let bytes = encode_message(&message);
        let mut cursor = io::Cursor::new(bytes);
        decode_message(&mut cursor)
            .expect("decode failed")
            .expect("unexpected EOF")
    }

    #[test]
    fn test_string_roundtrip_present_and_absent() {
        let mut out = Vec::new();
        encode_string(&mut out, Some("hello"));
        encode_string(&mut out, None);
        let mut cursor = io::Cursor::new(out);
        assert_eq!(decode_string(&mut cursor).unwrap().as_deref(), Some("hello"));
        assert_eq!(decode_string(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_part_result_roundtrip_all_kinds() {
        for kind in [
            PartResultKind::Success,
            PartResultKind::NonFatalFailure,
            PartResultKind::FatalFailure,
        ] {
            let original = TestPartResult::new(
                kind,
                Some("tests/widget.rs".to_string()),
                42,
                Some("expected 3, got 4".to_string()),
            );
            let decoded = roundtrip(ChannelMessage::PartResult(original.clone()));
            assert_eq!(decoded, ChannelMessage::PartResult(original));
        }
    }

    #[test]
    fn test_part_result_with_control_bytes_in_message() {
        // The message may contain tag bytes, newlines and NULs; the
        // length prefix has to carry the decode, not any delimiter.
        let original = TestPartResult::new(
            PartResultKind::FatalFailure,
            None,
            -1,
            Some("R\u{0}P\nE|A\tI".to_string()),
        );
        let decoded = roundtrip(ChannelMessage::PartResult(original.clone()));
        assert_eq!(decoded, ChannelMessage::PartResult(original));
    }

    #[test]
    fn test_property_roundtrip() {
        let original = ChannelMessage::Property(TestProperty {
            key: "k".to_string(),
            value: "v".to_string(),
        });
        assert_eq!(roundtrip(original.clone()), original);
    }

    #[test]
    fn test_bare_messages_are_one_byte() {
        assert_eq!(encode_message(&ChannelMessage::ClearResults), vec![TAG_CLEAR]);
        assert_eq!(encode_message(&ChannelMessage::Exited), vec![TAG_EXIT]);
    }

    #[test]
    fn test_internal_error_roundtrip() {
        let original = ChannelMessage::InternalError("pipe write failed".to_string());
        assert_eq!(roundtrip(original.clone()), original);
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let mut cursor = io::Cursor::new(vec![b'Z']);
        let err = decode_message(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("unexpected status byte"));
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        // 'R' followed by a kind byte outside S/N/F
        let mut cursor = io::Cursor::new(vec![TAG_RESULT, b'X']);
        assert!(decode_message(&mut cursor).is_err());
    }

    #[test]
    fn test_short_read_is_an_error_not_a_guess() {
        let mut bytes = encode_message(&ChannelMessage::PartResult(TestPartResult::new(
            PartResultKind::NonFatalFailure,
            Some("a.rs".to_string()),
            7,
            Some("boom".to_string()),
        )));
        bytes.truncate(bytes.len() - 2);
        let mut cursor = io::Cursor::new(bytes);
        assert!(decode_message(&mut cursor).is_err());
    }

    #[test]
    fn test_eof_on_boundary_is_none() {
        let mut cursor = io::Cursor::new(Vec::<u8>::new());
        assert_eq!(decode_message(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut bytes = vec![TAG_INTERNAL_ERROR, 1];
        bytes.extend_from_slice(&u32::MAX.to_ne_bytes());
        let mut cursor = io::Cursor::new(bytes);
        assert!(decode_message(&mut cursor).is_err());
    }

    #[test]
    fn test_tags_are_distinct() {
        let tags = [TAG_RESULT, TAG_PROPERTY, TAG_CLEAR, TAG_EXIT, TAG_INTERNAL_ERROR, ACK];
        for (i, a) in tags.iter().enumerate() {
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
