//! Transparent UDP proxy client setup
//!
//! Everything the unprivileged side needs before it can relay datagrams:
//! the transparent listening socket, a broker connection, and the session
//! table. The relay loop that moves payload between them is not part of
//! this crate yet.

use crate::broker::config::validate_socket_path;
use crate::error::{BrokerError, ConfigError};
use crate::session::{RecencyPolicy, DEFAULT_CAPACITY};
use nix::sys::socket::{
    bind, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn,
};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

/// Default listen address
pub const DEFAULT_IP: &str = "127.0.0.1";

/// Default listen port
pub const DEFAULT_PORT: &str = "3128";

/// Validated proxy client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the transparent socket binds to
    pub listen: SocketAddrV4,
    /// Rendezvous path of the broker
    pub broker_path: PathBuf,
    /// Session table capacity
    pub table_size: usize,
    /// Session eviction policy
    pub policy: RecencyPolicy,
}

impl ProxyConfig {
    /// Parse and validate the textual settings
    pub fn new(ip: &str, port: &str, broker_path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(ip.to_string()))?;
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPort(port.to_string()))?;
        let broker_path = broker_path.into();
        validate_socket_path(&broker_path)?;

        Ok(Self {
            listen: SocketAddrV4::new(ip, port),
            broker_path,
            table_size: DEFAULT_CAPACITY,
            policy: RecencyPolicy::default(),
        })
    }

    /// Override the session table capacity
    pub fn with_table_size(mut self, table_size: usize) -> Result<Self, ConfigError> {
        if table_size == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        self.table_size = table_size;
        Ok(self)
    }

    pub fn with_policy(mut self, policy: RecencyPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Bind the transparent listening socket
///
/// `IP_TRANSPARENT` needs `CAP_NET_ADMIN`; when an option cannot be set the
/// failure is logged and binding continues, so an unprivileged run still
/// gets an ordinary UDP socket.
pub fn bind_transparent(addr: SocketAddrV4) -> Result<UdpSocket, BrokerError> {
    let fd: OwnedFd = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| BrokerError::sys("socket", e))?;

    if let Err(e) = setsockopt(&fd, sockopt::ReuseAddr, &true) {
        log::warn!("setsockopt(SO_REUSEADDR): {}", e);
    }
    set_transparent_options(&fd);

    bind(fd.as_raw_fd(), &SockaddrIn::from(addr)).map_err(|e| BrokerError::sys("bind", e))?;
    log::info!("listening for datagrams on {}", addr);
    Ok(UdpSocket::from(fd))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_transparent_options(fd: &OwnedFd) {
    if let Err(e) = setsockopt(fd, sockopt::IpTransparent, &true) {
        log::warn!("setsockopt(IP_TRANSPARENT): {}", e);
    }
    if let Err(e) = setsockopt(fd, sockopt::Ipv4OrigDstAddr, &true) {
        log::warn!("setsockopt(IP_RECVORIGDSTADDR): {}", e);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_transparent_options(_fd: &OwnedFd) {
    log::warn!("transparent proxying is only supported on Linux");
}

/// Datagram relay entry point
///
/// Receiving a client datagram, forwarding it through the peer's session
/// socket and writing the reply back has not been designed yet.
pub fn relay() -> Result<(), BrokerError> {
    Err(BrokerError::RelayUnimplemented)
}
