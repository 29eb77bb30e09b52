//! Lightweight Prometheus-compatible metrics for the peer network.
//!
//! Uses atomic counters for lock-free instrumentation from both the I/O
//! thread and the control path. Renders in Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by the manager, its connections and the I/O thread.
pub struct Metrics {
    /// Connections currently in the managed set (gauge)
    pub active_connections: AtomicU64,
    /// Outbound connects started (counter)
    pub connections_initiated_total: AtomicU64,
    /// Inbound connections accepted (counter)
    pub connections_accepted_total: AtomicU64,
    /// Outbound connects that failed (counter)
    pub connection_failures_total: AtomicU64,
    /// Frames fully written to a peer (counter)
    pub frames_sent_total: AtomicU64,
    /// Frames decoded from a peer (counter)
    pub frames_received_total: AtomicU64,
    /// Bytes written to peers (counter)
    pub bytes_sent_total: AtomicU64,
    /// Bytes read from peers (counter)
    pub bytes_received_total: AtomicU64,
    /// Frames or datagrams that failed to decode (counter)
    pub decode_errors_total: AtomicU64,
    /// Introduction datagrams multicast (counter)
    pub discovery_broadcasts_total: AtomicU64,
    /// Discovery datagrams that did not lead to a connect (counter)
    pub discovery_ignored_total: AtomicU64,
    /// Creation time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            connections_initiated_total: AtomicU64::new(0),
            connections_accepted_total: AtomicU64::new(0),
            connection_failures_total: AtomicU64::new(0),
            frames_sent_total: AtomicU64::new(0),
            frames_received_total: AtomicU64::new(0),
            bytes_sent_total: AtomicU64::new(0),
            bytes_received_total: AtomicU64::new(0),
            decode_errors_total: AtomicU64::new(0),
            discovery_broadcasts_total: AtomicU64::new(0),
            discovery_ignored_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    ///
    /// `queued_frames` is sampled by the caller since it lives in the
    /// connections, not here.
    pub fn render(&self, queued_frames: usize) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP peernet_active_connections Current number of managed peer connections\n\
             # TYPE peernet_active_connections gauge\n\
             peernet_active_connections {}\n\
             # HELP peernet_queued_frames Frames waiting in outbound queues\n\
             # TYPE peernet_queued_frames gauge\n\
             peernet_queued_frames {}\n\
             # HELP peernet_connections_initiated_total Total outbound connects started\n\
             # TYPE peernet_connections_initiated_total counter\n\
             peernet_connections_initiated_total {}\n\
             # HELP peernet_connections_accepted_total Total inbound connections accepted\n\
             # TYPE peernet_connections_accepted_total counter\n\
             peernet_connections_accepted_total {}\n\
             # HELP peernet_connection_failures_total Total outbound connects that failed\n\
             # TYPE peernet_connection_failures_total counter\n\
             peernet_connection_failures_total {}\n\
             # HELP peernet_frames_sent_total Total frames written to peers\n\
             # TYPE peernet_frames_sent_total counter\n\
             peernet_frames_sent_total {}\n\
             # HELP peernet_frames_received_total Total frames decoded from peers\n\
             # TYPE peernet_frames_received_total counter\n\
             peernet_frames_received_total {}\n\
             # HELP peernet_bytes_sent_total Total bytes written to peers\n\
             # TYPE peernet_bytes_sent_total counter\n\
             peernet_bytes_sent_total {}\n\
             # HELP peernet_bytes_received_total Total bytes read from peers\n\
             # TYPE peernet_bytes_received_total counter\n\
             peernet_bytes_received_total {}\n\
             # HELP peernet_decode_errors_total Total frames or datagrams that failed to decode\n\
             # TYPE peernet_decode_errors_total counter\n\
             peernet_decode_errors_total {}\n\
             # HELP peernet_discovery_broadcasts_total Total discovery announcements sent\n\
             # TYPE peernet_discovery_broadcasts_total counter\n\
             peernet_discovery_broadcasts_total {}\n\
             # HELP peernet_discovery_ignored_total Total discovery datagrams ignored\n\
             # TYPE peernet_discovery_ignored_total counter\n\
             peernet_discovery_ignored_total {}\n\
             # HELP peernet_uptime_seconds Network layer uptime in seconds\n\
             # TYPE peernet_uptime_seconds gauge\n\
             peernet_uptime_seconds {}\n",
            self.active_connections.load(Ordering::Relaxed),
            queued_frames,
            self.connections_initiated_total.load(Ordering::Relaxed),
            self.connections_accepted_total.load(Ordering::Relaxed),
            self.connection_failures_total.load(Ordering::Relaxed),
            self.frames_sent_total.load(Ordering::Relaxed),
            self.frames_received_total.load(Ordering::Relaxed),
            self.bytes_sent_total.load(Ordering::Relaxed),
            self.bytes_received_total.load(Ordering::Relaxed),
            self.decode_errors_total.load(Ordering::Relaxed),
            self.discovery_broadcasts_total.load(Ordering::Relaxed),
            self.discovery_ignored_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
