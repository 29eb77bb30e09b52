//! Connection manager
//!
//! Owns the set of live connections, the handler registry and the I/O
//! thread. Every public entry point into the network layer goes through a
//! [`ConnectionManager`]; clones share the same state.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mio::net::TcpStream;
use mio::Waker;
use parking_lot::Mutex;

use crate::config::NetConfig;
use crate::connection::{Connection, Phase};
use crate::error::{NetError, Result};
use crate::events::{ConnectionEvent, EventBus, EventKind, EventPayload, Handler};
use crate::metrics::Metrics;
use crate::protocol::{self, ProtocolMessage};
use crate::transport::{Transport, FIRST_CONNECTION_TOKEN};

// ============================================================================
// Shared State
// ============================================================================

/// State shared by the manager handles, the connections and the I/O thread.
pub(crate) struct ManagerInner {
    pub(crate) config: NetConfig,
    connections: Mutex<Vec<Arc<Connection>>>,
    bus: EventBus,
    event_tx: Sender<ConnectionEvent>,
    event_rx: Receiver<ConnectionEvent>,
    waker: Mutex<Option<Arc<Waker>>>,
    pub(crate) stop: AtomicBool,
    io_thread: Mutex<Option<IoThread>>,
    next_id: AtomicUsize,
    pub(crate) metrics: Arc<Metrics>,
    local_stream_addr: Mutex<Option<SocketAddr>>,
}

struct IoThread {
    handle: JoinHandle<()>,
    /// Signalled by the thread as its last act
    done: Receiver<()>,
}

impl ManagerInner {
    /// Drop `conn` from the managed set. The socket is left to the caller.
    pub(crate) fn detach(&self, conn: &Arc<Connection>) {
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|c| !Arc::ptr_eq(c, conn));
        if connections.len() != before {
            self.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Queue an event for dispatch on the control thread.
    pub(crate) fn post(&self, event: ConnectionEvent) {
        // The receiver lives as long as `self`, so this cannot fail
        let _ = self.event_tx.send(event);
    }

    /// Interrupt the I/O thread's poll so it picks up new interest.
    pub(crate) fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            if let Err(e) = waker.wake() {
                log::debug!("Failed to wake I/O thread: {}", e);
            }
        }
    }

    /// Copy of the managed set, taken under the lock
    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }

    fn adopt(&self, conn: Arc<Connection>) -> Arc<Connection> {
        self.connections.lock().push(Arc::clone(&conn));
        self.metrics.active_connections.fetch_add(1, Ordering::Relaxed);
        conn
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: NetConfig) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        ConnectionManager {
            inner: Arc::new(ManagerInner {
                config,
                connections: Mutex::new(Vec::new()),
                bus: EventBus::new(),
                event_tx,
                event_rx,
                waker: Mutex::new(None),
                stop: AtomicBool::new(false),
                io_thread: Mutex::new(None),
                next_id: AtomicUsize::new(FIRST_CONNECTION_TOKEN),
                metrics: Arc::new(Metrics::new()),
                local_stream_addr: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        ConnectionManager { inner }
    }

    pub fn config(&self) -> &NetConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Bind the listening and discovery sockets and start the I/O thread.
    ///
    /// Socket setup happens here, so bind failures are returned to the caller
    /// rather than lost on the background thread.
    pub fn startup(&self) -> Result<()> {
        let mut io_thread = self.inner.io_thread.lock();
        if io_thread.is_some() {
            return Err(NetError::AlreadyRunning);
        }

        log::info!("Connection manager initializing");
        self.inner.config.validate()?;
        log::debug!("{} message types registered", protocol::standard_registry().len());
        self.inner.stop.store(false, Ordering::SeqCst);

        let transport = Transport::bind(&self.inner.config)?;
        *self.inner.waker.lock() = Some(transport.waker());
        *self.inner.local_stream_addr.lock() = Some(transport.local_stream_addr());

        let (done_tx, done) = crossbeam_channel::bounded(1);
        let weak = Arc::downgrade(&self.inner);
        let handle = thread::Builder::new()
            .name("peer-net-io".into())
            .spawn(move || {
                transport.run(weak);
                let _ = done_tx.send(());
            })?;

        *io_thread = Some(IoThread { handle, done });
        Ok(())
    }

    /// Stop the I/O thread, wait briefly for it, then close every remaining
    /// connection. A thread that does not stop in time is left to exit on its
    /// own.
    pub fn shutdown(&self) {
        log::info!("Connection manager shutting down");
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wake();

        let io_thread = self.inner.io_thread.lock().take();
        if let Some(io_thread) = io_thread {
            let grace = self.inner.config.shutdown_grace();
            match io_thread.done.recv_timeout(grace) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if io_thread.handle.join().is_err() {
                        log::error!("I/O thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("I/O thread did not stop within {:?}; proceeding", grace);
                }
            }
        }
        *self.inner.waker.lock() = None;
        *self.inner.local_stream_addr.lock() = None;

        for conn in self.inner.snapshot() {
            conn.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.io_thread.lock().is_some()
    }

    /// Address the listener is bound to while running
    pub fn local_stream_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_stream_addr.lock()
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Start a non-blocking connect to `host:port`.
    ///
    /// Returns as soon as the attempt is under way; CONNECTED or
    /// CONNECTION_FAILED follows once the I/O thread sees the outcome.
    pub fn connect(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        let addr = resolve_ipv4(host, port)?;
        let stream = TcpStream::connect(addr)?;
        log::debug!("Connecting to {}", addr);

        let conn = Connection::new(
            self.next_id(),
            stream,
            addr.ip().to_string(),
            port,
            Phase::Connecting,
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.metrics),
            self.inner.config.max_frame_len,
        );
        Metrics::incr(&self.inner.metrics.connections_initiated_total);
        let conn = self.inner.adopt(conn);
        self.inner.wake();
        Ok(conn)
    }

    /// Manage a socket accepted by the listener.
    pub fn accept_into(&self, stream: TcpStream, ip: IpAddr, port: u16) -> Arc<Connection> {
        log::debug!("Accepted {}:{}", ip, port);
        let conn = Connection::new(
            self.next_id(),
            stream,
            ip.to_string(),
            port,
            Phase::Accepting,
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.metrics),
            self.inner.config.max_frame_len,
        );
        Metrics::incr(&self.inner.metrics.connections_accepted_total);
        self.inner.adopt(conn)
    }

    /// Queue `message` on every managed connection. No-op with none.
    pub fn broadcast(&self, message: &ProtocolMessage) {
        for conn in self.inner.snapshot() {
            conn.send(message);
        }
    }

    /// Connections matching the optional peer IP and port filters.
    pub fn find(&self, host: Option<&str>, port: Option<u16>) -> Vec<Arc<Connection>> {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|c| host.map_or(true, |h| c.ip() == h))
            .filter(|c| port.map_or(true, |p| c.port() == p))
            .cloned()
            .collect()
    }

    /// Release `conn`'s socket and drop it from the managed set without
    /// raising CLOSED.
    pub fn remove(&self, conn: &Arc<Connection>) {
        conn.release();
        self.inner.detach(conn);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Frames waiting in every outbound queue
    pub fn queued_frames(&self) -> usize {
        self.inner.snapshot().iter().map(|c| c.queue_depth()).sum()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Prometheus text for the current counters and queue depth
    pub fn render_metrics(&self) -> String {
        self.inner.metrics.render(self.queued_frames())
    }

    fn next_id(&self) -> usize {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Register `handler` for `kind` under `key`, replacing any handler the
    /// same key already holds for that kind.
    pub fn add_handler<F>(&self, key: &str, kind: EventKind, handler: F)
    where
        F: Fn(&Arc<Connection>, EventKind, &EventPayload) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.inner.bus.add(key, kind, handler);
    }

    pub fn remove_handler(&self, key: &str, kind: EventKind) -> bool {
        self.inner.bus.remove(key, kind)
    }

    /// Dispatch every queued event on the calling thread. Returns how many
    /// events were dispatched.
    pub fn dispatch_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.inner.event_rx.try_recv() {
            self.dispatch(&event);
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for the first event, then dispatch everything
    /// queued.
    pub fn dispatch_for(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let first = match self.inner.event_rx.recv_deadline(deadline) {
            Ok(event) => event,
            Err(_) => return 0,
        };
        self.dispatch(&first);
        1 + self.dispatch_pending()
    }

    /// Take the next queued event without dispatching it.
    pub fn next_event(&self, timeout: Duration) -> Option<ConnectionEvent> {
        self.inner.event_rx.recv_timeout(timeout).ok()
    }

    fn dispatch(&self, event: &ConnectionEvent) {
        log::trace!("Dispatch {} for {}", event.kind, event.connection);
        if self.inner.bus.dispatch(event) == 0 {
            log::error!("Unhandled event: {} for {}", event.kind, event.connection);
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.get_mut().as_ref() {
            let _ = waker.wake();
        }
    }
}

/// Resolve `host` to its first IPv4 address.
fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetError::AddressResolution(format!("{}: {}", host, e)))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| NetError::AddressResolution(format!("{}: no IPv4 address", host)))
}
