//! Message type registry
//!
//! Maps numeric type IDs to body decoders. The process-wide registry is
//! built once from a fixed table; additional registries can be assembled for
//! tests or restricted endpoints, and reject duplicate IDs.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::messages::{
    Acknowledge, Clipboard, ClipboardHistoryEntry, ErrorMessage, FileContent, Introduction,
    TextMessage,
};
use super::wire::FieldReader;
use super::ProtocolMessage;
use crate::error::{DecodeError, RegistryError};

/// Decodes a message body (the bytes after the type ID).
pub type BodyDecoder = fn(&mut FieldReader<'_>) -> Result<ProtocolMessage, DecodeError>;

/// Every message type this build understands.
pub const STANDARD_TYPES: [(u16, &str, BodyDecoder); 7] = [
    (Introduction::TYPE_ID, "Introduction", decode_introduction),
    (Acknowledge::TYPE_ID, "Acknowledge", decode_acknowledge),
    (TextMessage::TYPE_ID, "Message", decode_message),
    (ErrorMessage::TYPE_ID, "Error", decode_error),
    (Clipboard::TYPE_ID, "Clipboard", decode_clipboard),
    (FileContent::TYPE_ID, "FileContent", decode_file),
    (ClipboardHistoryEntry::TYPE_ID, "ClipboardHistory", decode_history),
];

fn decode_introduction(r: &mut FieldReader<'_>) -> Result<ProtocolMessage, DecodeError> {
    Introduction::decode_body(r).map(ProtocolMessage::Introduction)
}

fn decode_acknowledge(r: &mut FieldReader<'_>) -> Result<ProtocolMessage, DecodeError> {
    Acknowledge::decode_body(r).map(ProtocolMessage::Acknowledge)
}

fn decode_message(r: &mut FieldReader<'_>) -> Result<ProtocolMessage, DecodeError> {
    TextMessage::decode_body(r).map(ProtocolMessage::Message)
}

fn decode_error(r: &mut FieldReader<'_>) -> Result<ProtocolMessage, DecodeError> {
    ErrorMessage::decode_body(r).map(ProtocolMessage::Error)
}

fn decode_clipboard(r: &mut FieldReader<'_>) -> Result<ProtocolMessage, DecodeError> {
    Clipboard::decode_body(r).map(ProtocolMessage::Clipboard)
}

fn decode_file(r: &mut FieldReader<'_>) -> Result<ProtocolMessage, DecodeError> {
    FileContent::decode_body(r).map(ProtocolMessage::File)
}

fn decode_history(r: &mut FieldReader<'_>) -> Result<ProtocolMessage, DecodeError> {
    ClipboardHistoryEntry::decode_body(r).map(ProtocolMessage::ClipboardHistory)
}

/// Registry shared by every connection and the discovery socket
pub(crate) static STANDARD: Lazy<MessageRegistry> = Lazy::new(MessageRegistry::standard);

// ============================================================================
// Registry
// ============================================================================

/// Type ID to decoder table.
pub struct MessageRegistry {
    decoders: HashMap<u16, (&'static str, BodyDecoder)>,
}

impl MessageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        MessageRegistry {
            decoders: HashMap::new(),
        }
    }

    /// Registry holding every type in [`STANDARD_TYPES`].
    ///
    /// # Panics
    ///
    /// Panics if the built-in table repeats a type ID.
    pub fn standard() -> Self {
        match Self::from_table(&STANDARD_TYPES) {
            Ok(registry) => registry,
            Err(e) => panic!("Invalid built-in message table: {}", e),
        }
    }

    /// Build a registry from `(id, name, decoder)` rows, rejecting the
    /// first repeated ID.
    pub fn from_table(table: &[(u16, &'static str, BodyDecoder)]) -> Result<Self, RegistryError> {
        let mut registry = MessageRegistry::new();
        for &(id, name, decoder) in table {
            registry.register(id, name, decoder)?;
        }
        Ok(registry)
    }

    /// Add a decoder for `id`. Fails if the ID is already taken.
    pub fn register(
        &mut self,
        id: u16,
        name: &'static str,
        decoder: BodyDecoder,
    ) -> Result<(), RegistryError> {
        if let Some(&(existing, _)) = self.decoders.get(&id) {
            return Err(RegistryError::DuplicateId {
                id,
                existing,
                new: name,
            });
        }
        self.decoders.insert(id, (name, decoder));
        Ok(())
    }

    /// Name registered for `id`, if any
    pub fn name_of(&self, id: u16) -> Option<&'static str> {
        self.decoders.get(&id).map(|(name, _)| *name)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode `[type id][body]`; the body must be consumed exactly.
    pub fn decode(&self, payload: &[u8]) -> Result<ProtocolMessage, DecodeError> {
        let mut reader = FieldReader::new(payload);
        let id = reader.u16()?;
        let (_, decoder) = self
            .decoders
            .get(&id)
            .ok_or(DecodeError::UnknownType(id))?;
        let msg = decoder(&mut reader)?;
        reader.finish()?;
        Ok(msg)
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
