//! LAN Peer Network
//!
//! This crate provides peer discovery and messaging for nodes on a local
//! network:
//! - UDP multicast discovery of other nodes
//! - Persistent TCP links with length-prefixed, type-tagged frames
//! - A single I/O thread driving every socket through mio
//! - Keyed event handlers, dispatched on the embedding application's thread
//!
//! ```no_run
//! use peer_net::{ConnectionManager, EventKind, NetConfig};
//! use std::time::Duration;
//!
//! let manager = ConnectionManager::new(NetConfig::default());
//! manager.add_handler("app", EventKind::Connected, |conn, _, _| {
//!     println!("linked to {}", conn.hostname());
//! });
//! manager.startup()?;
//! manager.dispatch_for(Duration::from_secs(1));
//! manager.shutdown();
//! # Ok::<(), peer_net::NetError>(())
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod framing;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod protocol;

mod transport;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{NetConfig, SettingsProvider};
pub use connection::Connection;
pub use discovery::{Decision, DiscoveryResponder, IgnoreReason};
pub use error::{ConfigError, DecodeError, NetError, RegistryError, Result};
pub use events::{ConnectionEvent, EventKind, EventPayload, Handler};
pub use framing::FrameAssembler;
pub use handler::{CoreHandler, HostSink};
pub use manager::ConnectionManager;
pub use metrics::Metrics;
pub use protocol::{
    clipboard_history_batch, Acknowledge, Clipboard, ClipboardHistoryEntry, ErrorMessage,
    FileContent, Introduction, ProtocolMessage, TextMessage,
};
