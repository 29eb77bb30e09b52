//! Field-level helpers for the binary layout
//!
//! All integers are big-endian. Fixed-width string fields are zero padded on
//! encode and trimmed of trailing zero bytes on decode. Variable-length text
//! carries its own 4-byte byte count ahead of the UTF-8 data.

use crate::error::DecodeError;

// ============================================================================
// Writer
// ============================================================================

/// Appends fields to an outgoing message body.
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        FieldWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write `text` into a field of exactly `width` bytes.
    ///
    /// Text longer than the field is cut at the last character boundary that
    /// fits, so the field always decodes as valid UTF-8.
    pub fn fixed_str(&mut self, text: &str, width: usize) -> &mut Self {
        let fitted = truncate_to_boundary(text, width);
        self.buf.extend_from_slice(fitted.as_bytes());
        self.buf.resize(self.buf.len() + (width - fitted.len()), 0);
        self
    }

    /// Write a 4-byte byte count followed by the UTF-8 bytes of `text`.
    pub fn text(&mut self, text: &str) -> &mut Self {
        self.u32(text.len() as u32);
        self.buf.extend_from_slice(text.as_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn truncate_to_boundary(text: &str, width: usize) -> &str {
    if text.len() <= width {
        return text;
    }
    let mut end = width;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ============================================================================
// Reader
// ============================================================================

/// Cursor over an incoming message body.
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        FieldReader { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.data.len() - self.pos;
        if available < len {
            return Err(DecodeError::Truncated {
                needed: len,
                available,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a zero padded field of `width` bytes.
    pub fn fixed_str(&mut self, width: usize, field: &'static str) -> Result<String, DecodeError> {
        let raw = self.take(width)?;
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        utf8(&raw[..end], field)
    }

    /// Read a 4-byte byte count and that many bytes of UTF-8 text.
    pub fn text(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        utf8(raw, field)
    }

    /// Fail if any bytes remain unread.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.data.len() - self.pos {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

fn utf8(raw: &[u8], field: &'static str) -> Result<String, DecodeError> {
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_str_pads_and_trims() {
        let mut w = FieldWriter::with_capacity(8);
        w.fixed_str("abc", 8);
        let buf = w.finish();
        assert_eq!(buf, b"abc\0\0\0\0\0");

        let mut r = FieldReader::new(&buf);
        assert_eq!(r.fixed_str(8, "name").unwrap(), "abc");
        r.finish().unwrap();
    }

    #[test]
    fn test_fixed_str_truncates_on_char_boundary() {
        // 'é' is two bytes; a 4-byte field cannot hold "abcé"
        let mut w = FieldWriter::with_capacity(4);
        w.fixed_str("abcé", 4);
        let buf = w.finish();
        assert_eq!(buf, b"abc\0");
    }

    #[test]
    fn test_text_length_prefix() {
        let mut w = FieldWriter::with_capacity(16);
        w.text("héllo");
        let buf = w.finish();
        assert_eq!(&buf[..4], &6u32.to_be_bytes());

        let mut r = FieldReader::new(&buf);
        assert_eq!(r.text("text").unwrap(), "héllo");
    }

    #[test]
    fn test_truncated_field() {
        let mut r = FieldReader::new(&[0x00, 0x00, 0x00, 0x09, b'a']);
        match r.text("text") {
            Err(DecodeError::Truncated { needed, available }) => {
                assert_eq!(needed, 9);
                assert_eq!(available, 1);
            }
            other => panic!("Expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut r = FieldReader::new(&[0xff, 0xfe, 0x00]);
        assert!(matches!(
            r.fixed_str(3, "user"),
            Err(DecodeError::InvalidUtf8 { field: "user" })
        ));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut r = FieldReader::new(&[1, 2, 3]);
        r.u8().unwrap();
        assert!(matches!(r.finish(), Err(DecodeError::TrailingBytes(2))));
    }
}
