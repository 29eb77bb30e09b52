//! Glue between network events and the host environment
//!
//! The host (an editor plugin, a console node, ...) implements [`HostSink`].
//! [`CoreHandler`] registers the standard handlers that report connection
//! state to it and apply incoming clipboard and introduction messages.

use std::sync::Arc;

use crate::connection::Connection;
use crate::events::{EventKind, EventPayload};
use crate::manager::ConnectionManager;
use crate::protocol::{ClipboardHistoryEntry, ErrorMessage, FileContent, ProtocolMessage, TextMessage};

/// Registration key used for every core handler
pub const CORE_HANDLER_KEY: &str = "core";

/// Connection state changes reported to the host log
const STATE_EVENTS: [EventKind; 5] = [
    EventKind::Connecting,
    EventKind::Accepting,
    EventKind::Connected,
    EventKind::Closed,
    EventKind::ConnectionFailed,
];

/// What the host environment provides to the network layer.
pub trait HostSink: Send + Sync {
    /// Show a status line to the user
    fn log_line(&self, line: &str);

    /// Replace the system clipboard contents
    fn set_clipboard(&self, text: &str);

    fn clipboard_history_entry(&self, _from: &Connection, _entry: &ClipboardHistoryEntry) {}

    fn file_received(&self, _from: &Connection, _file: &FileContent) {}

    fn text_received(&self, _from: &Connection, _message: &TextMessage) {}

    fn error_received(&self, _from: &Connection, _error: &ErrorMessage) {}
}

/// Standard event handlers, registered under [`CORE_HANDLER_KEY`].
pub struct CoreHandler;

impl CoreHandler {
    pub fn install(manager: &ConnectionManager, sink: Arc<dyn HostSink>) {
        for kind in STATE_EVENTS {
            let sink = Arc::clone(&sink);
            manager.add_handler(CORE_HANDLER_KEY, kind, move |conn, kind, _| {
                connection_state(sink.as_ref(), conn, kind);
            });
        }

        manager.add_handler(CORE_HANDLER_KEY, EventKind::Message, move |conn, _, payload| {
            if let EventPayload::Message(message) = payload {
                message_received(sink.as_ref(), conn, message);
            }
        });
    }

    /// Remove every handler registered under [`CORE_HANDLER_KEY`].
    pub fn uninstall(manager: &ConnectionManager) {
        for kind in EventKind::ALL {
            manager.remove_handler(CORE_HANDLER_KEY, kind);
        }
    }
}

fn connection_state(sink: &dyn HostSink, conn: &Connection, kind: EventKind) {
    sink.log_line(&format!("{}: {}:{}", kind.title(), conn.hostname(), conn.port()));
}

fn message_received(sink: &dyn HostSink, conn: &Connection, message: &ProtocolMessage) {
    match message {
        ProtocolMessage::Clipboard(clip) => {
            sink.log_line(&format!(
                "{} updated the clipboard ({} characters)",
                conn.hostname(),
                clip.text.chars().count()
            ));
            sink.set_clipboard(&clip.text);
        }
        ProtocolMessage::Introduction(intro) => {
            log::debug!("{} introduced itself as {}", conn.ip(), intro.hostname);
            conn.set_hostname(intro.hostname.as_str());
        }
        ProtocolMessage::ClipboardHistory(entry) => sink.clipboard_history_entry(conn, entry),
        ProtocolMessage::File(file) => sink.file_received(conn, file),
        ProtocolMessage::Message(text) => sink.text_received(conn, text),
        ProtocolMessage::Error(error) => sink.error_received(conn, error),
        ProtocolMessage::Acknowledge(ack) => log::debug!("{} from {}", ack, conn.hostname()),
    }
}
