//! Wire protocol: framing, message types and the type registry
//!
//! # Frame Format
//!
//! ```text
//! +----------------------+----------------+---------------------------+
//! | Length (4 bytes)     | Type ID        | Type-specific body        |
//! | of everything after  | (2 bytes)      | (fixed binary layout)     |
//! +----------------------+----------------+---------------------------+
//! ```
//!
//! All integers are big-endian. Discovery datagrams carry the same type ID
//! and body but no length prefix: the datagram itself is the boundary.

use std::fmt;

mod messages;
mod registry;
pub mod wire;

pub use messages::{
    clipboard_history_batch, Acknowledge, Clipboard, ClipboardHistoryEntry, ErrorMessage,
    FileContent, Introduction, TextMessage, HOSTNAME_WIDTH, IP_WIDTH, MAX_HISTORY_BATCH,
    PASSWORD_WIDTH, PATH_WIDTH, PLATFORM_WIDTH, PROTOCOL_VERSION, USER_WIDTH,
};
pub use registry::{BodyDecoder, MessageRegistry, STANDARD_TYPES};

use crate::error::DecodeError;
use wire::FieldWriter;

// ============================================================================
// Constants
// ============================================================================

/// Length prefix ahead of every stream frame
pub const FRAME_HEADER_LEN: usize = 4;

/// Type ID at the start of every payload
pub const TYPE_ID_LEN: usize = 2;

// ============================================================================
// Protocol Message
// ============================================================================

/// Any message that can cross the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Introduction(Introduction),
    Acknowledge(Acknowledge),
    Message(TextMessage),
    Error(ErrorMessage),
    Clipboard(Clipboard),
    File(FileContent),
    ClipboardHistory(ClipboardHistoryEntry),
}

impl ProtocolMessage {
    /// Numeric type ID written at the head of the payload
    pub fn msg_id(&self) -> u16 {
        match self {
            ProtocolMessage::Introduction(_) => Introduction::TYPE_ID,
            ProtocolMessage::Acknowledge(_) => Acknowledge::TYPE_ID,
            ProtocolMessage::Message(_) => TextMessage::TYPE_ID,
            ProtocolMessage::Error(_) => ErrorMessage::TYPE_ID,
            ProtocolMessage::Clipboard(_) => Clipboard::TYPE_ID,
            ProtocolMessage::File(_) => FileContent::TYPE_ID,
            ProtocolMessage::ClipboardHistory(_) => ClipboardHistoryEntry::TYPE_ID,
        }
    }

    /// `[type id][body]` without the stream length prefix.
    pub fn encode_datagram(&self) -> Vec<u8> {
        let mut w = FieldWriter::with_capacity(TYPE_ID_LEN + 64);
        w.u16(self.msg_id());
        match self {
            ProtocolMessage::Introduction(m) => m.encode_body(&mut w),
            ProtocolMessage::Acknowledge(m) => m.encode_body(&mut w),
            ProtocolMessage::Message(m) => m.encode_body(&mut w),
            ProtocolMessage::Error(m) => m.encode_body(&mut w),
            ProtocolMessage::Clipboard(m) => m.encode_body(&mut w),
            ProtocolMessage::File(m) => m.encode_body(&mut w),
            ProtocolMessage::ClipboardHistory(m) => m.encode_body(&mut w),
        }
        w.finish()
    }

    /// Full stream frame: 4-byte length, type ID, body.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_datagram();
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }
}

impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolMessage::Introduction(m) => fmt::Display::fmt(m, f),
            ProtocolMessage::Acknowledge(m) => fmt::Display::fmt(m, f),
            ProtocolMessage::Message(m) => fmt::Display::fmt(m, f),
            ProtocolMessage::Error(m) => fmt::Display::fmt(m, f),
            ProtocolMessage::Clipboard(m) => fmt::Display::fmt(m, f),
            ProtocolMessage::File(m) => fmt::Display::fmt(m, f),
            ProtocolMessage::ClipboardHistory(m) => fmt::Display::fmt(m, f),
        }
    }
}

macro_rules! impl_from_message {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ProtocolMessage {
                fn from(msg: $ty) -> Self {
                    ProtocolMessage::$variant(msg)
                }
            }
        )*
    };
}

impl_from_message! {
    Introduction => Introduction,
    Acknowledge => Acknowledge,
    TextMessage => Message,
    ErrorMessage => Error,
    Clipboard => Clipboard,
    FileContent => File,
    ClipboardHistoryEntry => ClipboardHistory,
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode one message from `buf` using the process-wide registry.
///
/// A stream frame (`is_datagram == false`) starts with the 4-byte length
/// prefix, which must match the bytes that follow. A datagram starts
/// directly with the type ID.
pub fn decode(buf: &[u8], is_datagram: bool) -> Result<ProtocolMessage, DecodeError> {
    if is_datagram {
        return decode_payload(buf);
    }

    if buf.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: FRAME_HEADER_LEN,
            available: buf.len(),
        });
    }
    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let payload = &buf[FRAME_HEADER_LEN..];
    if payload.len() < declared {
        return Err(DecodeError::Truncated {
            needed: declared,
            available: payload.len(),
        });
    }
    if payload.len() > declared {
        return Err(DecodeError::TrailingBytes(payload.len() - declared));
    }
    decode_payload(payload)
}

/// Decode `[type id][body]` with the process-wide registry.
pub fn decode_payload(payload: &[u8]) -> Result<ProtocolMessage, DecodeError> {
    registry::STANDARD.decode(payload)
}

/// The process-wide registry, built on first use.
pub(crate) fn standard_registry() -> &'static MessageRegistry {
    &registry::STANDARD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<ProtocolMessage> {
        vec![
            Introduction::new("tm", "secret", "192.168.1.20", 4377, "desk.lan", "linux").into(),
            Acknowledge::new(65535, false).into(),
            TextMessage::new("").into(),
            ErrorMessage::new(u32::MAX, "disk full ✗").into(),
            Clipboard::new("copied\nlines").into(),
            FileContent::new("a".repeat(PATH_WIDTH), "b".repeat(PATH_WIDTH), "").into(),
            ClipboardHistoryEntry::new(0, 0, "").into(),
        ]
    }

    #[test]
    fn test_frame_and_datagram_decode() {
        for msg in samples() {
            assert_eq!(decode(&msg.encode(), false).unwrap(), msg, "{}", msg);
            assert_eq!(decode(&msg.encode_datagram(), true).unwrap(), msg, "{}", msg);
        }
    }

    #[test]
    fn test_frame_header_counts_type_and_body() {
        // 2 (type) + 4 (len) + 5 (text)
        let frame = ProtocolMessage::from(Clipboard::new("hello")).encode();
        assert_eq!(&frame[..4], &[0, 0, 0, 11]);
        assert_eq!(&frame[4..6], &[0, 4]);
        assert_eq!(&frame[6..10], &[0, 0, 0, 5]);
        assert_eq!(&frame[10..], b"hello");
    }

    #[test]
    fn test_introduction_frame_size() {
        let frame = ProtocolMessage::from(Introduction::new("", "", "", 0, "", "")).encode();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + TYPE_ID_LEN + Introduction::BODY_LEN);
    }

    #[test]
    fn test_error_layout() {
        let payload = ProtocolMessage::from(ErrorMessage::new(7, "no")).encode_datagram();
        assert_eq!(payload, vec![0, 3, 0, 0, 0, 7, 0, 0, 0, 2, b'n', b'o']);
    }

    #[test]
    fn test_fixed_fields_trimmed() {
        let intro = Introduction::new("me", "", "10.0.0.5", 1, "h", "osx");
        let decoded = decode(&ProtocolMessage::from(intro).encode_datagram(), true).unwrap();
        match decoded {
            ProtocolMessage::Introduction(i) => {
                assert_eq!(i.user, "me");
                assert_eq!(i.password, "");
                assert_eq!(i.platform, "osx");
                assert_eq!(i.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("Expected Introduction, got {}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_error() {
        let frame = [0, 0, 0, 2, 0x00, 0x63];
        assert!(matches!(
            decode(&frame, false),
            Err(DecodeError::UnknownType(99))
        ));
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let mut frame = ProtocolMessage::from(TextMessage::new("abc")).encode();
        frame.push(0);
        assert!(matches!(
            decode(&frame, false),
            Err(DecodeError::TrailingBytes(1))
        ));
        frame.truncate(frame.len() - 3);
        assert!(matches!(
            decode(&frame, false),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_truncated_introduction_datagram() {
        let mut payload = ProtocolMessage::from(Introduction::new("", "", "", 0, "", "")).encode_datagram();
        payload.truncate(100);
        assert!(matches!(
            decode(&payload, true),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
