//! Concrete message types and their body layouts
//!
//! Each type writes and reads only its body (everything after the 2-byte
//! type ID). Framing and the type ID are handled in [`super`].

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use super::wire::{FieldReader, FieldWriter};
use crate::error::DecodeError;

// ============================================================================
// Field Widths
// ============================================================================

/// Protocol version carried in every Introduction
pub const PROTOCOL_VERSION: u8 = 1;

pub const USER_WIDTH: usize = 64;
pub const PASSWORD_WIDTH: usize = 64;
/// Wide enough for a textual IPv6 address
pub const IP_WIDTH: usize = 39;
pub const HOSTNAME_WIDTH: usize = 64;
pub const PLATFORM_WIDTH: usize = 8;
pub const PATH_WIDTH: usize = 256;

/// Most entries a single clipboard history batch can carry (u8 index/total)
pub const MAX_HISTORY_BATCH: usize = u8::MAX as usize;

// ============================================================================
// Introduction (0)
// ============================================================================

/// Identity announcement sent over discovery and on every new link.
///
/// The user and password travel with the message but are never verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    pub protocol_version: u8,
    pub user: String,
    pub password: String,
    pub ip: String,
    pub port: u16,
    pub hostname: String,
    pub platform: String,
}

impl Introduction {
    pub const TYPE_ID: u16 = 0;

    /// Fixed body size: version, user, password, ip, port, hostname, platform
    pub const BODY_LEN: usize =
        1 + USER_WIDTH + PASSWORD_WIDTH + IP_WIDTH + 2 + HOSTNAME_WIDTH + PLATFORM_WIDTH;

    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
        hostname: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Introduction {
            protocol_version: PROTOCOL_VERSION,
            user: user.into(),
            password: password.into(),
            ip: ip.into(),
            port,
            hostname: hostname.into(),
            platform: platform.into(),
        }
    }

    pub(crate) fn encode_body(&self, w: &mut FieldWriter) {
        w.u8(self.protocol_version)
            .fixed_str(&self.user, USER_WIDTH)
            .fixed_str(&self.password, PASSWORD_WIDTH)
            .fixed_str(&self.ip, IP_WIDTH)
            .u16(self.port)
            .fixed_str(&self.hostname, HOSTNAME_WIDTH)
            .fixed_str(&self.platform, PLATFORM_WIDTH);
    }

    pub(crate) fn decode_body(r: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Introduction {
            protocol_version: r.u8()?,
            user: r.fixed_str(USER_WIDTH, "user")?,
            password: r.fixed_str(PASSWORD_WIDTH, "password")?,
            ip: r.fixed_str(IP_WIDTH, "ip")?,
            port: r.u16()?,
            hostname: r.fixed_str(HOSTNAME_WIDTH, "hostname")?,
            platform: r.fixed_str(PLATFORM_WIDTH, "platform")?,
        })
    }
}

impl fmt::Display for Introduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Introduction user={} ip={}:{} host={} platform={} version={}>",
            self.user, self.ip, self.port, self.hostname, self.platform, self.protocol_version
        )
    }
}

// ============================================================================
// Acknowledge (1)
// ============================================================================

/// Machine readable ACK/NACK for an earlier message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge {
    pub message_id: u16,
    pub positive: bool,
}

impl Acknowledge {
    pub const TYPE_ID: u16 = 1;

    pub fn new(message_id: u16, positive: bool) -> Self {
        Acknowledge {
            message_id,
            positive,
        }
    }

    pub(crate) fn encode_body(&self, w: &mut FieldWriter) {
        w.u16(self.message_id).u8(self.positive as u8);
    }

    pub(crate) fn decode_body(r: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Acknowledge {
            message_id: r.u16()?,
            positive: r.u8()? != 0,
        })
    }
}

impl fmt::Display for Acknowledge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Acknowledge message_id={} positive={}>",
            self.message_id, self.positive
        )
    }
}

// ============================================================================
// Message (2)
// ============================================================================

/// Informational free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub text: String,
}

impl TextMessage {
    pub const TYPE_ID: u16 = 2;

    pub fn new(text: impl Into<String>) -> Self {
        TextMessage { text: text.into() }
    }

    pub(crate) fn encode_body(&self, w: &mut FieldWriter) {
        w.text(&self.text);
    }

    pub(crate) fn decode_body(r: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(TextMessage {
            text: r.text("text")?,
        })
    }
}

impl fmt::Display for TextMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Message msg='{}'>", self.text)
    }
}

// ============================================================================
// Error (3)
// ============================================================================

/// Numeric error code with an explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: u32,
    pub text: String,
}

impl ErrorMessage {
    pub const TYPE_ID: u16 = 3;

    pub fn new(code: u32, text: impl Into<String>) -> Self {
        ErrorMessage {
            code,
            text: text.into(),
        }
    }

    pub(crate) fn encode_body(&self, w: &mut FieldWriter) {
        w.u32(self.code).text(&self.text);
    }

    pub(crate) fn decode_body(r: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(ErrorMessage {
            code: r.u32()?,
            text: r.text("text")?,
        })
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Error code={} msg='{}'>", self.code, self.text)
    }
}

// ============================================================================
// Clipboard (4)
// ============================================================================

/// Text contents of a peer's clipboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clipboard {
    pub text: String,
}

impl Clipboard {
    pub const TYPE_ID: u16 = 4;

    pub fn new(text: impl Into<String>) -> Self {
        Clipboard { text: text.into() }
    }

    pub(crate) fn encode_body(&self, w: &mut FieldWriter) {
        w.text(&self.text);
    }

    pub(crate) fn decode_body(r: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Clipboard {
            text: r.text("text")?,
        })
    }
}

impl fmt::Display for Clipboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Clipboard chars={}>", self.text.chars().count())
    }
}

// ============================================================================
// File (5)
// ============================================================================

/// A whole file: where it lives and what it contains.
///
/// Content is carried as UTF-8 text, so binary files cannot be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub root_path: String,
    pub relative_name: String,
    pub content: String,
}

impl FileContent {
    pub const TYPE_ID: u16 = 5;

    pub fn new(
        root_path: impl Into<String>,
        relative_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        FileContent {
            root_path: root_path.into(),
            relative_name: relative_name.into(),
            content: content.into(),
        }
    }

    /// Load `relative_name` under `root_path` from disk, buffered whole.
    pub fn read(root_path: &str, relative_name: &str) -> io::Result<Self> {
        let content = fs::read_to_string(Path::new(root_path).join(relative_name))?;
        Ok(FileContent::new(root_path, relative_name, content))
    }

    pub(crate) fn encode_body(&self, w: &mut FieldWriter) {
        w.fixed_str(&self.root_path, PATH_WIDTH)
            .fixed_str(&self.relative_name, PATH_WIDTH)
            .text(&self.content);
    }

    pub(crate) fn decode_body(r: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(FileContent {
            root_path: r.fixed_str(PATH_WIDTH, "root_path")?,
            relative_name: r.fixed_str(PATH_WIDTH, "relative_name")?,
            content: r.text("content")?,
        })
    }
}

impl fmt::Display for FileContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<FileContent root='{}' name='{}' size={}>",
            self.root_path,
            self.relative_name,
            self.content.len()
        )
    }
}

// ============================================================================
// Clipboard History Entry (6)
// ============================================================================

/// One entry of a clipboard history batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardHistoryEntry {
    pub index: u8,
    pub total: u8,
    pub text: String,
}

impl ClipboardHistoryEntry {
    pub const TYPE_ID: u16 = 6;

    pub fn new(index: u8, total: u8, text: impl Into<String>) -> Self {
        ClipboardHistoryEntry {
            index,
            total,
            text: text.into(),
        }
    }

    pub(crate) fn encode_body(&self, w: &mut FieldWriter) {
        w.u8(self.index).u8(self.total).text(&self.text);
    }

    pub(crate) fn decode_body(r: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(ClipboardHistoryEntry {
            index: r.u8()?,
            total: r.u8()?,
            text: r.text("text")?,
        })
    }
}

impl fmt::Display for ClipboardHistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<ClipboardHistory chars={} ({}/{})>",
            self.text.chars().count(),
            self.index,
            self.total
        )
    }
}

/// Build the history batch for `entries`, newest first as given.
///
/// At most [`MAX_HISTORY_BATCH`] entries are kept; the rest are dropped.
pub fn clipboard_history_batch<S: AsRef<str>>(entries: &[S]) -> Vec<ClipboardHistoryEntry> {
    let kept = &entries[..entries.len().min(MAX_HISTORY_BATCH)];
    let total = kept.len() as u8;
    kept.iter()
        .enumerate()
        .map(|(i, text)| ClipboardHistoryEntry::new(i as u8, total, text.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_introduction_body_len() {
        let intro = Introduction::new("u", "p", "10.0.0.5", 4377, "host", "linux");
        let mut w = FieldWriter::with_capacity(Introduction::BODY_LEN);
        intro.encode_body(&mut w);
        assert_eq!(w.finish().len(), Introduction::BODY_LEN);
        assert_eq!(Introduction::BODY_LEN, 242);
    }

    #[test]
    fn test_acknowledge_layout() {
        let mut w = FieldWriter::with_capacity(3);
        Acknowledge::new(0x0102, true).encode_body(&mut w);
        assert_eq!(w.finish(), vec![0x01, 0x02, 0x01]);
    }

    #[test]
    fn test_file_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "line one\n").unwrap();

        let root = dir.path().to_str().unwrap();
        let file = FileContent::read(root, "notes.txt").unwrap();
        assert_eq!(file.relative_name, "notes.txt");
        assert_eq!(file.content, "line one\n");
    }

    #[test]
    fn test_history_batch_indices() {
        let batch = clipboard_history_batch(&["a", "b", "c"]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], ClipboardHistoryEntry::new(0, 3, "a"));
        assert_eq!(batch[2], ClipboardHistoryEntry::new(2, 3, "c"));
    }

    #[test]
    fn test_history_batch_is_bounded() {
        let entries: Vec<String> = (0..300).map(|i| i.to_string()).collect();
        let batch = clipboard_history_batch(&entries);
        assert_eq!(batch.len(), MAX_HISTORY_BATCH);
        assert!(batch.iter().all(|e| e.total == 255));
        assert_eq!(batch.last().unwrap().index, 254);
    }

    #[test]
    fn test_display_summaries() {
        assert_eq!(
            Acknowledge::new(7, false).to_string(),
            "<Acknowledge message_id=7 positive=false>"
        );
        assert_eq!(
            ErrorMessage::new(404, "gone").to_string(),
            "<Error code=404 msg='gone'>"
        );
    }
}
