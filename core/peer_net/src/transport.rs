//! The I/O thread
//!
//! One thread owns the discovery socket and the TCP listener and performs
//! every socket read and write. Each pass it re-arms interest for all managed
//! connections, polls with a bounded timeout, services whatever became ready
//! and sends the discovery announcement when it is due.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::config::NetConfig;
use crate::connection::Connection;
use crate::discovery::{self, DiscoveryResponder, DISCOVERY_BUFFER_LEN};
use crate::error::Result;
use crate::manager::{ConnectionManager, ManagerInner};
use crate::metrics::Metrics;
use crate::protocol::ProtocolMessage;

// ============================================================================
// Tokens
// ============================================================================

/// mio token for the discovery UDP socket
const DISCOVERY_TOKEN: Token = Token(0);

/// mio token for the TCP listener
const LISTENER_TOKEN: Token = Token(1);

/// mio token for the waker used by send() and shutdown()
const WAKER_TOKEN: Token = Token(2);

/// Connection tokens are allocated from here upward
pub(crate) const FIRST_CONNECTION_TOKEN: usize = 3;

// ============================================================================
// Transport
// ============================================================================

struct Discovery {
    socket: UdpSocket,
    group: SocketAddr,
    /// Our Introduction without the stream length prefix
    announcement: Vec<u8>,
    interval: Duration,
    last_broadcast: Option<Instant>,
    buf: Vec<u8>,
}

pub(crate) struct Transport {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    listener: TcpListener,
    local_stream_addr: SocketAddr,
    discovery: Option<Discovery>,
    responder: DiscoveryResponder,
    poll_interval: Duration,
}

impl Transport {
    /// Create the poll and bind every server-side socket.
    pub(crate) fn bind(config: &NetConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listener = TcpListener::bind(config.stream_bind_addr()?)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_stream_addr = listener.local_addr()?;
        log::info!("Listening for peers on {}", local_stream_addr);

        // Built once; the announcement never changes while running
        let introduction = discovery::local_introduction(config, local_stream_addr.port());
        log::info!("Local identity: {}", introduction);

        let discovery = if config.discovery_enabled {
            let mut socket = discovery::make_discovery_socket(config)?;
            poll.registry()
                .register(&mut socket, DISCOVERY_TOKEN, Interest::READABLE)?;
            Some(Discovery {
                socket,
                group: config.discovery_addr()?,
                announcement: ProtocolMessage::from(introduction.clone()).encode_datagram(),
                interval: config.broadcast_interval(),
                last_broadcast: None,
                buf: vec![0u8; DISCOVERY_BUFFER_LEN],
            })
        } else {
            log::info!("Discovery disabled");
            None
        };

        Ok(Transport {
            poll,
            events: Events::with_capacity(1024),
            waker,
            listener,
            local_stream_addr,
            discovery,
            responder: DiscoveryResponder::new(introduction),
            poll_interval: config.poll_interval(),
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub(crate) fn local_stream_addr(&self) -> SocketAddr {
        self.local_stream_addr
    }

    /// Loop until the stop flag is set or the manager is dropped. Sockets are
    /// left open on exit; the manager's shutdown closes the connections.
    pub(crate) fn run(mut self, owner: Weak<ManagerInner>) {
        log::info!("Entering network loop");

        loop {
            let Some(inner) = owner.upgrade() else {
                break;
            };
            if inner.stop.load(Ordering::SeqCst) {
                break;
            }

            let manager = ConnectionManager::from_inner(inner);
            if let Err(e) = self.turn(&manager) {
                log::error!("Network loop failed: {}", e);
                break;
            }
        }

        log::info!("Network thread is gracefully ending");
    }

    /// One pass: arm, poll, service, announce.
    fn turn(&mut self, manager: &ConnectionManager) -> io::Result<()> {
        let connections = manager.find(None, None);
        for conn in &connections {
            arm(self.poll.registry(), conn);
        }

        match self.poll.poll(&mut self.events, Some(self.poll_interval)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        // Copy out the readiness so handlers can borrow self mutably
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let failed = event.is_error();
                (
                    event.token(),
                    event.is_readable() || event.is_read_closed() || failed,
                    event.is_writable() || failed,
                )
            })
            .collect();

        let by_token: HashMap<Token, &Arc<Connection>> =
            connections.iter().map(|c| (c.token(), c)).collect();

        for (token, readable, writable) in ready {
            match token {
                DISCOVERY_TOKEN => self.receive_discovery(manager),
                LISTENER_TOKEN => self.accept_peers(manager),
                WAKER_TOKEN => {}
                token => {
                    // Closed since the snapshot, or unknown
                    let Some(conn) = by_token.get(&token) else {
                        continue;
                    };
                    if readable {
                        conn.perform_receive();
                    }
                    if writable {
                        conn.perform_send();
                    }
                }
            }
        }

        self.announce(manager.metrics());
        Ok(())
    }

    /// Drain the discovery socket, acting on each datagram.
    fn receive_discovery(&mut self, manager: &ConnectionManager) {
        let Some(discovery) = self.discovery.as_mut() else {
            return;
        };
        loop {
            match discovery.socket.recv_from(&mut discovery.buf) {
                Ok((len, from)) => {
                    log::trace!("Discovery datagram ({} bytes) from {}", len, from);
                    self.responder.handle_datagram(&discovery.buf[..len], manager);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Discovery receive failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Accept every pending inbound connection.
    fn accept_peers(&mut self, manager: &ConnectionManager) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    manager.accept_into(stream, addr.ip(), addr.port());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Multicast our Introduction if it has never been sent or the interval
    /// has passed.
    fn announce(&mut self, metrics: &Metrics) {
        let Some(discovery) = self.discovery.as_mut() else {
            return;
        };
        let due = discovery
            .last_broadcast
            .map_or(true, |at| at.elapsed() > discovery.interval);
        if !due {
            return;
        }

        match discovery.socket.send_to(&discovery.announcement, discovery.group) {
            Ok(_) => {
                log::debug!("Discovery broadcast to {}", discovery.group);
                Metrics::incr(&metrics.discovery_broadcasts_total);
            }
            Err(e) => log::warn!("Discovery broadcast failed: {}", e),
        }
        discovery.last_broadcast = Some(Instant::now());
    }
}

/// Re-arm one connection. A link the poll refuses can never make progress,
/// so it is closed and leaves the managed set.
fn arm(registry: &Registry, conn: &Arc<Connection>) -> bool {
    match conn.update_interest(registry) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Cannot register {}, closing: {}", conn, e);
            conn.close();
            false
        }
    }
}
