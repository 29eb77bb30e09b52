//! One peer link over a non-blocking TCP socket
//!
//! A [`Connection`] owns its socket, an outbound queue of encoded frames and
//! the receive-side frame assembler. Only the I/O thread performs socket
//! reads and writes; any thread may queue messages or close the link.
//!
//! Lifecycle:
//!
//! ```text
//! Connecting ──┐
//!              ├──> Connected ──> Closed
//! Accepting  ──┘
//! ```
//!
//! `Closed` is reachable from every state and is terminal. Once closed a
//! connection raises no further events.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::{Arc, Weak};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;

use crate::events::{ConnectionEvent, EventKind, EventPayload};
use crate::framing::FrameAssembler;
use crate::manager::ManagerInner;
use crate::metrics::Metrics;
use crate::protocol::ProtocolMessage;

// ============================================================================
// Constants
// ============================================================================

/// Queue entries written per writable event, so one busy peer cannot starve
/// the rest of the poll pass
const MAX_SENDS_PER_PASS: usize = 10;

/// Bytes read per readable event
const RECV_CHUNK: usize = 4096;

// ============================================================================
// Link State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Outbound connect in progress
    Connecting,
    /// Accepted socket not yet confirmed by a writable event
    Accepting,
    Connected,
    Closed,
}

/// Everything the I/O thread touches, behind one lock.
struct LinkState {
    stream: Option<TcpStream>,
    phase: Phase,
    outbound: VecDeque<Vec<u8>>,
    /// Front frame being written and how much of it is already out
    partial: Option<(Vec<u8>, usize)>,
    frames: FrameAssembler,
    registered: bool,
}

impl LinkState {
    fn has_pending_output(&self) -> bool {
        self.partial.is_some() || !self.outbound.is_empty()
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct Connection {
    id: usize,
    ip: String,
    port: u16,
    hostname: Mutex<String>,
    state: Mutex<LinkState>,
    owner: Weak<ManagerInner>,
    metrics: Arc<Metrics>,
}

impl Connection {
    /// Wrap a freshly connected or accepted socket and raise
    /// CONNECTING/ACCEPTING.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        stream: TcpStream,
        ip: String,
        port: u16,
        phase: Phase,
        owner: Weak<ManagerInner>,
        metrics: Arc<Metrics>,
        max_frame_len: usize,
    ) -> Arc<Self> {
        let conn = Arc::new(Connection {
            id,
            hostname: Mutex::new(ip.clone()),
            ip,
            port,
            state: Mutex::new(LinkState {
                stream: Some(stream),
                phase,
                outbound: VecDeque::new(),
                partial: None,
                frames: FrameAssembler::new(max_frame_len),
                registered: false,
            }),
            owner,
            metrics,
        });

        let kind = match phase {
            Phase::Accepting => EventKind::Accepting,
            _ => EventKind::Connecting,
        };
        log::debug!("{}: {}:{}", kind, conn.ip, conn.port);
        conn.post(kind, EventPayload::None);
        conn
    }

    /// A closed connection with no socket and no owner.
    #[cfg(test)]
    pub(crate) fn detached(ip: &str, port: u16) -> Arc<Self> {
        Arc::new(Connection {
            id: usize::MAX,
            ip: ip.to_string(),
            port,
            hostname: Mutex::new(ip.to_string()),
            state: Mutex::new(LinkState {
                stream: None,
                phase: Phase::Closed,
                outbound: VecDeque::new(),
                partial: None,
                frames: FrameAssembler::default(),
                registered: false,
            }),
            owner: Weak::new(),
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.id)
    }

    /// Peer IP address as text
    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Display label: the peer IP until an Introduction names the host
    pub fn hostname(&self) -> String {
        self.hostname.lock().clone()
    }

    pub fn set_hostname(&self, hostname: impl Into<String>) {
        *self.hostname.lock() = hostname.into();
    }

    // ------------------------------------------------------------------------
    // Control path
    // ------------------------------------------------------------------------

    /// Queue `message` for delivery. Never blocks and never fails; messages
    /// queued on a closed connection are dropped.
    pub fn send(&self, message: &ProtocolMessage) {
        {
            let mut st = self.state.lock();
            if st.phase == Phase::Closed {
                log::debug!("Dropping {} for closed connection {}:{}", message, self.ip, self.port);
                return;
            }
            log::trace!("Queue {} for {}:{}", message, self.ip, self.port);
            st.outbound.push_back(message.encode());
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.wake();
        }
    }

    /// Close the link: leave the managed set, release the socket and raise
    /// CLOSED. Queued data is discarded. Calling it again does nothing.
    pub fn close(self: &Arc<Self>) {
        if !self.release() {
            return;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.detach(self);
        }
        log::debug!("Closed: {}:{}", self.ip, self.port);
        self.post(EventKind::Closed, EventPayload::None);
    }

    /// Shut down and drop the socket. Returns false if already closed.
    pub(crate) fn release(&self) -> bool {
        let stream = {
            let mut st = self.state.lock();
            if st.phase == Phase::Closed {
                return false;
            }
            st.phase = Phase::Closed;
            st.outbound.clear();
            st.partial = None;
            st.stream.take()
        };
        if let Some(stream) = stream {
            // Peer may already have reset the link
            let _ = stream.shutdown(Shutdown::Both);
        }
        true
    }

    /// True while the socket is open and either the connect is unconfirmed or
    /// output is pending.
    pub fn is_writable(&self) -> bool {
        let st = self.state.lock();
        st.stream.is_some() && (st.phase != Phase::Connected || st.has_pending_output())
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().phase == Phase::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().phase == Phase::Closed
    }

    /// Frames waiting to be written, counting a partially written one
    pub fn queue_depth(&self) -> usize {
        let st = self.state.lock();
        st.outbound.len() + st.partial.is_some() as usize
    }

    // ------------------------------------------------------------------------
    // I/O thread
    // ------------------------------------------------------------------------

    /// Register or re-arm the socket with the poll. Connected links always
    /// want reads; writes only while something is owed to the peer.
    pub(crate) fn update_interest(&self, registry: &Registry) -> io::Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let Some(stream) = st.stream.as_mut() else {
            return Ok(());
        };

        let interest = match st.phase {
            Phase::Connected if st.partial.is_some() || !st.outbound.is_empty() => {
                Interest::READABLE | Interest::WRITABLE
            }
            Phase::Connected => Interest::READABLE,
            _ => Interest::WRITABLE,
        };

        if st.registered {
            registry.reregister(stream, self.token(), interest)
        } else {
            registry.register(stream, self.token(), interest)?;
            st.registered = true;
            Ok(())
        }
    }

    /// Handle write readiness: confirm a pending connect, then flush up to
    /// [`MAX_SENDS_PER_PASS`] queued frames.
    pub(crate) fn perform_send(self: &Arc<Self>) {
        let mut fatal = false;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let Some(stream) = st.stream.as_mut() else {
                return;
            };

            if st.phase != Phase::Connected {
                match connect_status(stream) {
                    Ok(true) => {
                        st.phase = Phase::Connected;
                        log::debug!("Connected: {}:{}", self.ip, self.port);
                        self.post(EventKind::Connected, EventPayload::None);
                    }
                    Ok(false) => return,
                    Err(e) => {
                        log::warn!("Connection Failed: {}:{}: {}", self.ip, self.port, e);
                        Metrics::incr(&self.metrics.connection_failures_total);
                        self.post(EventKind::ConnectionFailed, EventPayload::Error(e.to_string()));
                        fatal = true;
                    }
                }
            }

            if !fatal {
                for _ in 0..MAX_SENDS_PER_PASS {
                    if st.partial.is_none() {
                        match st.outbound.pop_front() {
                            Some(frame) => st.partial = Some((frame, 0)),
                            None => break,
                        }
                    }
                    let Some((frame, offset)) = st.partial.as_mut() else {
                        break;
                    };

                    match stream.write(&frame[*offset..]) {
                        Ok(n) => {
                            *offset += n;
                            Metrics::add(&self.metrics.bytes_sent_total, n);
                            if *offset < frame.len() {
                                break;
                            }
                            st.partial = None;
                            Metrics::incr(&self.metrics.frames_sent_total);
                        }
                        Err(e) if is_transient(&e) => break,
                        Err(e) => {
                            log::warn!("Send Error: {}:{}: {}", self.ip, self.port, e);
                            self.post(EventKind::SendError, EventPayload::Error(e.to_string()));
                            fatal = true;
                            break;
                        }
                    }
                }
            }
        }

        if fatal {
            self.close();
        }
    }

    /// Handle read readiness: read one chunk and raise MESSAGE for every
    /// frame it completes.
    pub(crate) fn perform_receive(self: &Arc<Self>) {
        let mut fatal = false;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.phase != Phase::Connected {
                return;
            }
            let Some(stream) = st.stream.as_mut() else {
                return;
            };

            let mut chunk = [0u8; RECV_CHUNK];
            match stream.read(&mut chunk) {
                Ok(0) => {
                    log::debug!("Peer closed: {}:{}", self.ip, self.port);
                    fatal = true;
                }
                Ok(n) => {
                    Metrics::add(&self.metrics.bytes_received_total, n);
                    st.frames.extend(&chunk[..n]);
                    loop {
                        match st.frames.next_message() {
                            Ok(Some(message)) => {
                                log::trace!("Recv {} from {}:{}", message, self.ip, self.port);
                                Metrics::incr(&self.metrics.frames_received_total);
                                self.post(EventKind::Message, EventPayload::Message(message));
                            }
                            Ok(None) => break,
                            Err(e) => {
                                log::warn!("Recv Error: {}:{}: {}", self.ip, self.port, e);
                                Metrics::incr(&self.metrics.decode_errors_total);
                                self.post(EventKind::RecvError, EventPayload::Error(e.to_string()));
                                fatal = true;
                                break;
                            }
                        }
                    }
                }
                Err(e) if is_transient(&e) => {}
                Err(e) => {
                    log::warn!("Recv Error: {}:{}: {}", self.ip, self.port, e);
                    self.post(EventKind::RecvError, EventPayload::Error(e.to_string()));
                    fatal = true;
                }
            }
        }

        if fatal {
            self.close();
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Hand an event to the owner for dispatch on the control thread.
    ///
    /// I/O-driven events are posted while the link state is locked, so a
    /// concurrent close always orders its CLOSED after them.
    fn post(self: &Arc<Self>, kind: EventKind, payload: EventPayload) {
        match self.owner.upgrade() {
            Some(owner) => owner.post(ConnectionEvent {
                connection: Arc::clone(self),
                kind,
                payload,
            }),
            None => log::error!(
                "Unhandled event: {} {:?} {}",
                kind,
                payload,
                self
            ),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Connection ip='{}:{} ({})' id={}>",
            self.ip,
            self.port,
            self.hostname.lock(),
            self.id
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Whether a non-blocking connect has finished: `Ok(true)` once established,
/// `Ok(false)` while still in flight, `Err` with the socket error on failure.
fn connect_status(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
