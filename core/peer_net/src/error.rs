//! Error types for the peer network layer

use std::io;

/// Result type alias
pub type Result<T> = std::result::Result<T, NetError>;

/// Failure to decode a frame or datagram into a protocol message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than the layout requires
    #[error("truncated message: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required to read the next field
        needed: usize,
        /// Bytes remaining in the buffer
        available: usize,
    },

    /// Type ID with no registered decoder
    #[error("unknown message type ({0})")]
    UnknownType(u16),

    /// Text field that is not valid UTF-8
    #[error("invalid UTF-8 in field '{field}'")]
    InvalidUtf8 {
        /// Name of the offending field
        field: &'static str,
    },

    /// Bytes left over after the last field of the layout
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    /// Length prefix above the configured frame limit
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Length announced by the prefix
        len: usize,
        /// Configured maximum
        max: usize,
    },
}

/// Failure to register a message type in a codec registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two message types claim the same numeric ID
    #[error("duplicate message type detected ({id}: {existing} and {new})")]
    DuplicateId {
        /// Contested type ID
        id: u16,
        /// Name already registered under the ID
        existing: &'static str,
        /// Name that was rejected
        new: &'static str,
    },
}

/// Failure to load or validate network settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Settings file could not be read
    #[error("cannot read settings: {0}")]
    Io(#[from] io::Error),

    /// Settings were not valid JSON or had the wrong shape
    #[error("cannot parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    /// A setting parsed but holds an unusable value
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Errors surfaced by the connection manager and I/O thread setup.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Host name did not resolve to an IPv4 address
    #[error("cannot resolve address: {0}")]
    AddressResolution(String),

    /// `startup` called twice
    #[error("network thread is already running")]
    AlreadyRunning,

    /// Settings rejected at startup
    #[error(transparent)]
    Config(#[from] ConfigError),
}
