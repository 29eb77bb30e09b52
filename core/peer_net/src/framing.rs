//! Receive-side frame assembly
//!
//! Bytes arrive from the socket in arbitrary chunks. The assembler buffers
//! them, parses the 4-byte length prefix once it is complete, and slices out
//! each frame as soon as all of its bytes are present.

use crate::error::DecodeError;
use crate::protocol::{self, ProtocolMessage, FRAME_HEADER_LEN};

/// Default upper bound on a single frame (64 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Accumulates stream bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    /// Length of the frame at the front of `buffer`, once its prefix is parsed
    expected_length: Option<usize>,
    max_frame_len: usize,
}

impl FrameAssembler {
    pub fn new(max_frame_len: usize) -> Self {
        FrameAssembler {
            buffer: Vec::new(),
            expected_length: None,
            max_frame_len,
        }
    }

    /// Append raw bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// On error the stream can no longer be trusted; the caller is expected to
    /// drop the connection.
    pub fn next_message(&mut self) -> Result<Option<ProtocolMessage>, DecodeError> {
        if self.expected_length.is_none() {
            if self.buffer.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if len > self.max_frame_len {
                return Err(DecodeError::FrameTooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }
            self.buffer.drain(..FRAME_HEADER_LEN);
            self.expected_length = Some(len);
        }

        let len = match self.expected_length {
            Some(len) if self.buffer.len() >= len => len,
            _ => return Ok(None),
        };

        let message = protocol::decode_payload(&self.buffer[..len])?;
        self.buffer.drain(..len);
        self.expected_length = None;
        Ok(Some(message))
    }

    /// Append `data` and decode every frame that is now complete, in order.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<ProtocolMessage>, DecodeError> {
        self.extend(data);
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Bytes held that do not yet form a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Length of the frame currently being assembled, if its prefix is parsed
    pub fn expected_length(&self) -> Option<usize> {
        self.expected_length
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
