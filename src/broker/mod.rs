//! Socket broker: a privileged helper that creates sockets for an unprivileged client
//!
//! - `protocol`: Fd handoff protocol (one tag byte in, one SCM_RIGHTS descriptor out)
//! - `server`: Unix socket listener and accept loop (with fork-per-connection handlers)
//! - `client`: Client side of the handoff, used by the proxy
//! - `config`: Rendezvous path validation and broker settings

pub mod protocol;
pub mod server;
pub mod client;
pub mod config;

pub use protocol::{SocketKind, send_fd, recv_fd, TAG_STREAM, TAG_DATAGRAM};
pub use server::BrokerServer;
pub use client::BrokerClient;
pub use config::{BrokerConfig, MAX_SOCKET_PATH};
