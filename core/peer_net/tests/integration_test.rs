//! Integration tests for the peer network
//!
//! Two managers talk over loopback TCP with discovery disabled; discovery
//! decisions are driven with crafted datagrams. Raw std sockets stand in for
//! misbehaving peers and for other nodes on the discovery port.

use std::io::{Read, Write};
use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream, UdpSocket as StdUdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use peer_net::{
    Clipboard, Connection, ConnectionEvent, ConnectionManager, CoreHandler, DiscoveryResponder,
    EventKind, EventPayload, HostSink, Introduction, NetConfig, ProtocolMessage, TextMessage,
};

const WAIT: Duration = Duration::from_secs(5);

fn config(hostname: &str) -> NetConfig {
    NetConfig {
        discovery_enabled: false,
        stream_ip: "127.0.0.1".into(),
        stream_port: 0,
        hostname: hostname.into(),
        poll_interval_ms: 50,
        ..NetConfig::default()
    }
}

fn started(hostname: &str) -> ConnectionManager {
    let _ = env_logger::builder().is_test(true).try_init();
    let manager = ConnectionManager::new(config(hostname));
    manager.startup().unwrap();
    manager
}

/// Take events until one of `kind` arrives, discarding the rest.
fn expect_event(manager: &ConnectionManager, kind: EventKind) -> ConnectionEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match manager.next_event(remaining) {
            Some(event) if event.kind == kind => return event,
            Some(_) => continue,
            None => panic!("timed out waiting for {:?}", kind),
        }
    }
}

/// Collect `count` decoded messages, in arrival order.
fn expect_messages(manager: &ConnectionManager, count: usize) -> Vec<ProtocolMessage> {
    let mut messages = Vec::new();
    while messages.len() < count {
        let event = expect_event(manager, EventKind::Message);
        if let EventPayload::Message(message) = event.payload {
            messages.push(message);
        }
    }
    messages
}

/// Take every event up to and including the first one `done` accepts.
fn collect_until<F>(manager: &ConnectionManager, mut done: F) -> Vec<ConnectionEvent>
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    let mut events = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match manager.next_event(remaining) {
            Some(event) => {
                let last = done(&event);
                events.push(event);
                if last {
                    return events;
                }
            }
            None => panic!("timed out after {:?}", events),
        }
    }
}

/// Open a raw socket to `manager` and wait until its link is connected.
fn raw_peer(manager: &ConnectionManager) -> StdTcpStream {
    let stream = StdTcpStream::connect(manager.local_stream_addr().unwrap()).unwrap();
    stream.set_nodelay(true).unwrap();
    let port = stream.local_addr().unwrap().port();
    collect_until(manager, |e| {
        e.kind == EventKind::Connected && e.connection.port() == port
    });
    stream
}

fn text_frame(text: &str) -> Vec<u8> {
    ProtocolMessage::from(TextMessage::new(text)).encode()
}

/// Link `a` to `b`; returns a's connection once both sides are connected.
fn link(a: &ConnectionManager, b: &ConnectionManager) -> Arc<Connection> {
    let port = b.local_stream_addr().unwrap().port();
    let conn = a.connect("127.0.0.1", port).unwrap();
    assert!(!conn.is_connected());

    assert_eq!(expect_event(a, EventKind::Connecting).connection.id(), conn.id());
    expect_event(a, EventKind::Connected);
    assert!(conn.is_connected());

    expect_event(b, EventKind::Accepting);
    expect_event(b, EventKind::Connected);
    conn
}

#[test]
fn test_messages_arrive_in_order() {
    let a = started("node-a");
    let b = started("node-b");
    let conn = link(&a, &b);

    let sent: Vec<ProtocolMessage> = (0..20)
        .map(|i| TextMessage::new(format!("message {}", i)).into())
        .collect();
    for message in &sent {
        conn.send(message);
    }

    assert_eq!(expect_messages(&b, sent.len()), sent);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_large_frame_spans_reads() {
    let a = started("node-a");
    let b = started("node-b");
    let conn = link(&a, &b);

    // Several times the receive chunk, so it is assembled across reads
    let text: String = "clipboard ".repeat(5000);
    let big: ProtocolMessage = Clipboard::new(text.clone()).into();
    conn.send(&big);
    conn.send(&TextMessage::new("after").into());

    let received = expect_messages(&b, 2);
    assert_eq!(received[0], big);
    assert_eq!(received[1], TextMessage::new("after").into());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_close_and_find() {
    let a = started("node-a");
    let b = started("node-b");
    let conn = link(&a, &b);

    assert_eq!(a.find(None, None).len(), 1);
    assert_eq!(a.find(Some("127.0.0.1"), None).len(), 1);
    assert!(a.find(Some("10.0.0.5"), None).is_empty());
    assert_eq!(a.find(None, Some(conn.port())).len(), 1);
    assert_eq!(b.find(Some("127.0.0.1"), None).len(), 1);

    conn.close();
    assert!(!conn.is_writable());
    assert!(a.find(None, None).is_empty());
    conn.close();

    expect_event(&a, EventKind::Closed);
    assert!(a.next_event(Duration::from_millis(200)).is_none());

    // The peer sees the zero-length read and closes its side
    expect_event(&b, EventKind::Closed);
    assert!(b.find(None, None).is_empty());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_connect_failure_removes_connection() {
    let a = started("node-a");

    let port = {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    match a.connect("127.0.0.1", port) {
        Ok(conn) => {
            let failed = expect_event(&a, EventKind::ConnectionFailed);
            assert_eq!(failed.connection.id(), conn.id());
            assert!(failed.payload.error().is_some());
            expect_event(&a, EventKind::Closed);
            assert!(a.find(None, None).is_empty());
            assert!(!conn.is_writable());
        }
        // Some platforms refuse a loopback connect synchronously
        Err(e) => eprintln!("connect failed immediately: {}", e),
    }

    a.shutdown();
}

#[test]
fn test_shutdown_closes_connections() {
    let a = started("node-a");
    let b = started("node-b");
    let conn = link(&a, &b);

    a.shutdown();
    assert!(!a.is_running());
    assert_eq!(a.connection_count(), 0);
    assert!(conn.is_closed());
    expect_event(&a, EventKind::Closed);

    b.shutdown();
}

#[test]
fn test_discovery_responder() {
    let a = ConnectionManager::new(config("node-a"));
    let b = started("node-b");
    let b_port = b.local_stream_addr().unwrap().port();

    let responder =
        DiscoveryResponder::new(Introduction::new("", "", "127.0.0.1", 1, "node-a", "linux"));

    // Our own announcement echoed back, twice
    let own = ProtocolMessage::from(Introduction::new("", "", "127.0.0.1", 1, "node-a", "linux"))
        .encode_datagram();
    assert!(responder.handle_datagram(&own, &a).is_none());
    assert!(responder.handle_datagram(&own, &a).is_none());
    assert_eq!(a.connection_count(), 0);

    let peer =
        ProtocolMessage::from(Introduction::new("", "", "127.0.0.1", b_port, "node-b", "linux"))
            .encode_datagram();
    let conn = responder.handle_datagram(&peer, &a).unwrap();
    assert_eq!(conn.hostname(), "node-b");
    assert_eq!(conn.queue_depth(), 1);
    assert_eq!(a.connection_count(), 1);

    // Already linked to that IP
    assert!(responder.handle_datagram(&peer, &a).is_none());
    assert_eq!(a.connection_count(), 1);

    // Once the I/O thread runs, the queued Introduction reaches the peer
    a.startup().unwrap();
    match expect_messages(&b, 1).remove(0) {
        ProtocolMessage::Introduction(intro) => assert_eq!(intro.hostname, "node-a"),
        other => panic!("Expected Introduction, got {}", other),
    }

    a.shutdown();
    b.shutdown();
}

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<String>>,
    clipboard: Mutex<Option<String>>,
}

impl HostSink for RecordingSink {
    fn log_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }

    fn set_clipboard(&self, text: &str) {
        *self.clipboard.lock() = Some(text.to_string());
    }
}

#[test]
fn test_core_handler_applies_clipboard() {
    let a = started("node-a");
    let b = started("node-b");
    let sink = Arc::new(RecordingSink::default());
    CoreHandler::install(&b, sink.clone());

    let port = b.local_stream_addr().unwrap().port();
    let conn = a.connect("127.0.0.1", port).unwrap();
    conn.send(&Introduction::new("", "", "127.0.0.1", 1, "node-a", "linux").into());
    conn.send(&Clipboard::new("shared text").into());

    let deadline = Instant::now() + WAIT;
    while sink.clipboard.lock().is_none() {
        assert!(Instant::now() < deadline, "clipboard never applied");
        b.dispatch_for(Duration::from_millis(50));
    }

    assert_eq!(sink.clipboard.lock().as_deref(), Some("shared text"));
    let lines = sink.lines.lock().clone();
    assert!(lines.iter().any(|l| l.starts_with("Accepting: 127.0.0.1:")));
    assert!(lines.contains(&"node-a updated the clipboard (11 characters)".to_string()));
    assert_eq!(b.find(None, None)[0].hostname(), "node-a");

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_metrics_track_traffic() {
    let a = started("node-a");
    let b = started("node-b");
    let conn = link(&a, &b);

    conn.send(&TextMessage::new("counted").into());
    expect_messages(&b, 1);

    let rendered = b.render_metrics();
    assert!(rendered.contains("peernet_frames_received_total 1"));
    assert!(rendered.contains("peernet_connections_accepted_total 1"));
    assert!(a.render_metrics().contains("peernet_connections_initiated_total 1"));

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_unknown_type_closes_only_that_link() {
    let b = started("node-b");
    let mut bad = raw_peer(&b);
    let mut good = raw_peer(&b);
    let bad_port = bad.local_addr().unwrap().port();
    let good_port = good.local_addr().unwrap().port();
    assert_eq!(b.connection_count(), 2);

    // Length 2, type 99, no body
    bad.write_all(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x63]).unwrap();
    let events = collect_until(&b, |e| e.kind == EventKind::Closed);
    assert_eq!(events.len(), 2, "{:?}", events);
    assert_eq!(events[0].kind, EventKind::RecvError);
    assert_eq!(events[0].connection.port(), bad_port);
    let error = events[0].payload.error().unwrap();
    assert!(error.contains("unknown message type (99)"), "{}", error);
    assert_eq!(events[1].connection.id(), events[0].connection.id());
    let closed_id = events[1].connection.id();

    good.write_all(&text_frame("ok")).unwrap();
    let event = expect_event(&b, EventKind::Message);
    assert_eq!(event.connection.port(), good_port);
    assert_ne!(event.connection.id(), closed_id);
    assert_eq!(
        event.payload.message(),
        Some(&ProtocolMessage::from(TextMessage::new("ok")))
    );

    // Nothing further for the closed link
    assert!(b.next_event(Duration::from_millis(200)).is_none());
    assert_eq!(b.connection_count(), 1);
    assert!(b.find(None, Some(bad_port)).is_empty());

    // The peer sees its socket shut down
    bad.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 1];
    match bad.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        other => panic!("Expected a closed socket, got {:?}", other),
    }

    b.shutdown();
}

#[test]
fn test_coalesced_and_split_frames() {
    let b = started("node-b");
    let mut peer = raw_peer(&b);

    let mut burst = text_frame("first");
    burst.extend(text_frame("second"));
    let third = text_frame("third");

    // Two whole frames and half of the third frame's length prefix
    burst.extend(&third[..2]);
    peer.write_all(&burst).unwrap();
    thread::sleep(Duration::from_millis(100));

    peer.write_all(&third[2..4]).unwrap();
    thread::sleep(Duration::from_millis(100));
    peer.write_all(&third[4..]).unwrap();

    let events = collect_until(&b, |e| {
        e.payload.message() == Some(&ProtocolMessage::from(TextMessage::new("third")))
    });
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Message; 3]);
    let texts: Vec<ProtocolMessage> = events
        .into_iter()
        .filter_map(|e| e.payload.message().cloned())
        .collect();
    assert_eq!(
        texts,
        vec![
            TextMessage::new("first").into(),
            TextMessage::new("second").into(),
            TextMessage::new("third").into(),
        ]
    );
    assert_eq!(b.connection_count(), 1);

    b.shutdown();
}

#[test]
fn test_discovery_socket_links_new_hosts_once() {
    let b = started("node-b");
    let b_port = b.local_stream_addr().unwrap().port();

    let discovery_port = StdUdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let a = ConnectionManager::new(NetConfig {
        discovery_enabled: true,
        discovery_port,
        discovery_ttl: 1,
        ..config("node-a")
    });
    if let Err(e) = a.startup() {
        // Hosts without a multicast route cannot join the group
        eprintln!("Skipping: discovery socket unavailable ({})", e);
        b.shutdown();
        return;
    }

    let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    let target = ("127.0.0.1", discovery_port);
    let ignored = || a.metrics().discovery_ignored_total.load(Ordering::Relaxed);

    let own = ProtocolMessage::from(Introduction::new("", "", "127.0.0.1", 1, "node-a", "linux"))
        .encode_datagram();
    sender.send_to(&own, target).unwrap();
    sender.send_to(&own, target).unwrap();

    let peer =
        ProtocolMessage::from(Introduction::new("", "", "127.0.0.1", b_port, "node-b", "linux"))
            .encode_datagram();
    sender.send_to(&peer, target).unwrap();

    // Datagrams are handled in order, so both echoes were dropped first
    let connecting = expect_event(&a, EventKind::Connecting);
    assert_eq!(connecting.connection.port(), b_port);
    assert!(ignored() >= 2);
    assert_eq!(a.connection_count(), 1);

    match expect_messages(&b, 1).remove(0) {
        ProtocolMessage::Introduction(intro) => assert_eq!(intro.hostname, "node-a"),
        other => panic!("Expected Introduction, got {}", other),
    }
    assert_eq!(connecting.connection.hostname(), "node-b");

    // A repeat from an address we are already linked to
    let before = ignored();
    sender.send_to(&peer, target).unwrap();
    let deadline = Instant::now() + WAIT;
    while ignored() == before {
        assert!(Instant::now() < deadline, "repeat announcement never handled");
        thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(a.connection_count(), 1);
    assert!(b.next_event(Duration::from_millis(200)).is_none());
    assert_eq!(b.connection_count(), 1);

    a.shutdown();
    b.shutdown();
}
