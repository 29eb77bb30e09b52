//! Connection events and the handler registry
//!
//! Connections never call handlers directly. Each event is posted to a
//! single-consumer channel and dispatched on whichever thread the embedding
//! application pumps the manager from.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::protocol::ProtocolMessage;

// ============================================================================
// Event Kinds
// ============================================================================

/// Lifecycle and traffic events raised by a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Closed,
    Connecting,
    Accepting,
    Connected,
    ConnectionFailed,
    SendError,
    RecvError,
    Message,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Closed,
        EventKind::Connecting,
        EventKind::Accepting,
        EventKind::Connected,
        EventKind::ConnectionFailed,
        EventKind::SendError,
        EventKind::RecvError,
        EventKind::Message,
    ];

    /// Human readable title used in host log lines
    pub fn title(self) -> &'static str {
        match self {
            EventKind::Closed => "Closed",
            EventKind::Connecting => "Connecting",
            EventKind::Accepting => "Accepting",
            EventKind::Connected => "Connected",
            EventKind::ConnectionFailed => "Connection Failed",
            EventKind::SendError => "Send Error",
            EventKind::RecvError => "Receive Error",
            EventKind::Message => "Message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Data carried with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    None,
    /// Error description for failure events
    Error(String),
    /// Decoded message for [`EventKind::Message`]
    Message(ProtocolMessage),
}

impl EventPayload {
    pub fn message(&self) -> Option<&ProtocolMessage> {
        match self {
            EventPayload::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            EventPayload::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// One raised event, queued for dispatch.
#[derive(Clone)]
pub struct ConnectionEvent {
    pub connection: Arc<Connection>,
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEvent")
            .field("connection", &format_args!("{}:{}", self.connection.ip(), self.connection.port()))
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .finish()
    }
}

// ============================================================================
// Handler Registry
// ============================================================================

/// Callback invoked for every event of the kinds it is registered for.
pub type Handler = Arc<dyn Fn(&Arc<Connection>, EventKind, &EventPayload) + Send + Sync>;

/// Per-kind handler lists, each entry tagged with its registration key.
///
/// Handlers for a kind run in registration order. Re-registering an existing
/// key replaces its handler without moving it.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<(String, Handler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &str, kind: EventKind, handler: Handler) {
        let mut handlers = self.handlers.lock();
        let list = handlers.entry(kind).or_default();
        match list.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = handler,
            None => list.push((key.to_string(), handler)),
        }
    }

    /// Returns true if a handler was registered under `key` for `kind`.
    pub fn remove(&self, key: &str, kind: EventKind) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(k, _)| k != key);
        before != list.len()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every handler for the event's kind. Returns how many ran.
    ///
    /// The list is cloned first so handlers may register or remove handlers
    /// (or call back into the manager) without deadlocking.
    pub fn dispatch(&self, event: &ConnectionEvent) -> usize {
        let snapshot: Vec<Handler> = match self.handlers.lock().get(&event.kind) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &snapshot {
            handler(&event.connection, event.kind, &event.payload);
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(kind: EventKind) -> ConnectionEvent {
        ConnectionEvent {
            connection: Connection::detached("10.0.0.5", 4377),
            kind,
            payload: EventPayload::None,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Handler {
        let log = Arc::clone(log);
        Arc::new(move |_, _, _| log.lock().push(tag))
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.add("a", EventKind::Connected, recorder(&log, "a"));
        bus.add("b", EventKind::Connected, recorder(&log, "b"));
        bus.add("c", EventKind::Closed, recorder(&log, "c"));

        assert_eq!(bus.dispatch(&event(EventKind::Connected)), 2);
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_same_key_replaces_in_place() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.add("a", EventKind::Message, recorder(&log, "a1"));
        bus.add("b", EventKind::Message, recorder(&log, "b"));
        bus.add("a", EventKind::Message, recorder(&log, "a2"));

        bus.dispatch(&event(EventKind::Message));
        assert_eq!(*log.lock(), vec!["a2", "b"]);
        assert_eq!(bus.handler_count(EventKind::Message), 2);
    }

    #[test]
    fn test_remove_only_touches_key_and_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for kind in [EventKind::Connected, EventKind::Closed] {
            let hits = Arc::clone(&hits);
            bus.add("core", kind, Arc::new(move |_, _, _| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert!(bus.remove("core", EventKind::Connected));
        assert!(!bus.remove("core", EventKind::Connected));
        assert!(!bus.remove("other", EventKind::Closed));

        assert_eq!(bus.dispatch(&event(EventKind::Connected)), 0);
        assert_eq!(bus.dispatch(&event(EventKind::Closed)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_reenter_bus() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.add("once", EventKind::Closed, Arc::new(move |_, kind, _| {
            inner.remove("once", kind);
        }));

        assert_eq!(bus.dispatch(&event(EventKind::Closed)), 1);
        assert_eq!(bus.handler_count(EventKind::Closed), 0);
    }

    #[test]
    fn test_titles() {
        assert_eq!(EventKind::ConnectionFailed.title(), "Connection Failed");
        assert_eq!(EventKind::Connected.to_string(), "Connected");
    }
}
