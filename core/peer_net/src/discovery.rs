//! Multicast discovery
//!
//! Every node periodically multicasts an Introduction datagram. A node that
//! hears a peer it is not yet linked to connects to the advertised stream
//! address and introduces itself on the new link.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::Arc;

use mio::net::UdpSocket;

use crate::config::NetConfig;
use crate::connection::Connection;
use crate::manager::ConnectionManager;
use crate::metrics::Metrics;
use crate::protocol::{self, Introduction, ProtocolMessage, PROTOCOL_VERSION};

/// Receive buffer for one discovery datagram
pub const DISCOVERY_BUFFER_LEN: usize = 10240;

/// Address "connected" to find the interface holding the default route.
/// Nothing is sent.
const ROUTE_TARGET_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(10, 255, 255, 255), 1);

// ============================================================================
// Responder
// ============================================================================

/// Why a discovery datagram did not lead to a connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Our own announcement, or a peer using our host name
    OwnHostname,
    /// Peer speaks another protocol version
    VersionMismatch(u8),
    /// A link to the advertised IP already exists
    AlreadyConnected,
    /// Valid message that is not an Introduction
    NotIntroduction,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::OwnHostname => f.write_str("own host name"),
            IgnoreReason::VersionMismatch(v) => write!(f, "protocol version {}", v),
            IgnoreReason::AlreadyConnected => f.write_str("already connected"),
            IgnoreReason::NotIntroduction => f.write_str("not an introduction"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Connect,
    Ignore(IgnoreReason),
}

/// Decides what to do with discovery datagrams and acts on them.
pub struct DiscoveryResponder {
    introduction: Introduction,
}

impl DiscoveryResponder {
    /// `introduction` is our identity; it is compared against incoming
    /// announcements and sent on every link discovery opens.
    pub fn new(introduction: Introduction) -> Self {
        DiscoveryResponder { introduction }
    }

    pub fn introduction(&self) -> &Introduction {
        &self.introduction
    }

    /// Checks run in order: own host name, protocol version, existing link.
    ///
    /// Peers are told apart by host name and IP only; two nodes configured
    /// with the same host name never connect to each other.
    pub fn evaluate(&self, peer: &Introduction, manager: &ConnectionManager) -> Decision {
        if peer.hostname == self.introduction.hostname {
            return Decision::Ignore(IgnoreReason::OwnHostname);
        }
        if peer.protocol_version != PROTOCOL_VERSION {
            return Decision::Ignore(IgnoreReason::VersionMismatch(peer.protocol_version));
        }
        // The port is not compared: a peer that connected to us first is
        // seen on its ephemeral port
        if !manager.find(Some(peer.ip.as_str()), None).is_empty() {
            return Decision::Ignore(IgnoreReason::AlreadyConnected);
        }
        Decision::Connect
    }

    /// Decode one datagram and connect to the peer it announces if
    /// [`evaluate`](Self::evaluate) says so. Returns the new connection.
    pub fn handle_datagram(
        &self,
        data: &[u8],
        manager: &ConnectionManager,
    ) -> Option<Arc<Connection>> {
        let peer = match protocol::decode(data, true) {
            Ok(ProtocolMessage::Introduction(intro)) => intro,
            Ok(other) => {
                self.ignored(&other.to_string(), IgnoreReason::NotIntroduction, manager);
                return None;
            }
            Err(e) => {
                log::debug!("Discarding discovery datagram: {}", e);
                Metrics::incr(&manager.metrics().decode_errors_total);
                return None;
            }
        };

        match self.evaluate(&peer, manager) {
            Decision::Ignore(reason) => {
                self.ignored(&peer.to_string(), reason, manager);
                None
            }
            Decision::Connect => {
                log::info!("Discovered {} at {}:{}", peer.hostname, peer.ip, peer.port);
                match manager.connect(&peer.ip, peer.port) {
                    Ok(conn) => {
                        conn.set_hostname(peer.hostname.as_str());
                        conn.send(&self.introduction.clone().into());
                        Some(conn)
                    }
                    Err(e) => {
                        log::warn!("Cannot connect to {} at {}:{}: {}", peer.hostname, peer.ip, peer.port, e);
                        None
                    }
                }
            }
        }
    }

    fn ignored(&self, what: &str, reason: IgnoreReason, manager: &ConnectionManager) {
        log::debug!("Ignoring discovery {} ({})", what, reason);
        Metrics::incr(&manager.metrics().discovery_ignored_total);
    }
}

// ============================================================================
// Local Identity
// ============================================================================

/// Our Introduction: configured values, falling back to the detected local
/// IP, the system host name and the platform name.
pub fn local_introduction(config: &NetConfig, stream_port: u16) -> Introduction {
    let ip = if config.stream_ip.is_empty() {
        local_ip().to_string()
    } else {
        config.stream_ip.clone()
    };
    let hostname = if config.hostname.is_empty() {
        system_hostname()
    } else {
        config.hostname.clone()
    };
    Introduction::new(
        config.user.as_str(),
        config.password.as_str(),
        ip,
        stream_port,
        hostname,
        platform_name(),
    )
}

/// Address of the interface holding the default route, or loopback.
pub fn local_ip() -> Ipv4Addr {
    let routed = || -> io::Result<Ipv4Addr> {
        let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(ROUTE_TARGET_ADDR)?;
        match socket.local_addr()?.ip() {
            std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            _ => Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no IPv4 route")),
        }
    };
    routed().unwrap_or(Ipv4Addr::LOCALHOST)
}

/// System host name
#[cfg(unix)]
pub fn system_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(not(unix))]
pub fn system_hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Platform tag carried in the Introduction
pub fn platform_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "osx"
    } else if cfg!(windows) {
        "windows"
    } else {
        "linux"
    }
}

// ============================================================================
// Discovery Socket
// ============================================================================

/// UDP socket bound to the discovery port on every interface, joined to the
/// discovery group, with the configured multicast TTL.
pub(crate) fn make_discovery_socket(config: &NetConfig) -> io::Result<UdpSocket> {
    let group = config
        .discovery_group_ip()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let socket = bind_reusable_udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.discovery_port))?;
    socket.set_nonblocking(true)?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(config.discovery_ttl)?;

    log::info!(
        "Discovery on {}:{} (ttl {})",
        group,
        config.discovery_port,
        config.discovery_ttl
    );
    Ok(UdpSocket::from_std(socket))
}

/// Bind with SO_REUSEADDR and SO_REUSEPORT set, so several nodes on one
/// host can share the discovery port.
#[cfg(unix)]
fn bind_reusable_udp(addr: SocketAddrV4) -> io::Result<StdUdpSocket> {
    use std::mem;
    use std::os::unix::io::FromRawFd;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Owns the fd from here, so every early return closes it
        let socket = StdUdpSocket::from_raw_fd(fd);

        let one: libc::c_int = 1;
        for option in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
            let rc = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let mut sin: libc::sockaddr_in = mem::zeroed();
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = addr.port().to_be();
        sin.sin_addr = libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        };
        let rc = libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(socket)
    }
}

#[cfg(not(unix))]
fn bind_reusable_udp(addr: SocketAddrV4) -> io::Result<StdUdpSocket> {
    StdUdpSocket::bind(addr)
}
