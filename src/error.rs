//! Typed errors for the socket broker and its clients
//!
//! Every failure is sorted into one of three families so that both the
//! broker and the proxy client can exit with a code that says what went
//! wrong instead of a bare `1`:
//!
//! | Family        | Exit code | Examples                                   |
//! |---------------|-----------|--------------------------------------------|
//! | I/O, resource | 1         | socket creation failed, `sendmsg` failed   |
//! | Configuration | 2         | missing or oversized rendezvous path       |
//! | Protocol      | 3         | unknown tag byte, malformed ancillary data |

use std::io;
use thiserror::Error;

/// Exit code for success
pub const EXIT_SUCCESS: u8 = 0;

/// Exit code for I/O and resource failures
pub const EXIT_FAILURE: u8 = 1;

/// Exit code for configuration errors detected at startup
pub const EXIT_CONFIG: u8 = 2;

/// Exit code for handoff protocol violations
pub const EXIT_PROTOCOL: u8 = 3;

/// Startup configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No rendezvous path was supplied
    #[error("listen path expected")]
    MissingSocketPath,

    /// Rendezvous path does not fit in `sockaddr_un.sun_path`
    #[error("socket path too long: {len} bytes (max {max})")]
    SocketPathTooLong { len: usize, max: usize },

    /// Listen address did not parse as an IPv4 address
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    /// Port did not parse as a 16-bit number
    #[error("invalid port number '{0}'")]
    InvalidPort(String),

    /// Session table capacity of zero
    #[error("session table size must be at least 1")]
    ZeroCapacity,
}

/// Violations of the fd handoff protocol
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Request byte is neither the stream nor the datagram tag
    #[error("invalid socket type {0}")]
    InvalidTag(u8),

    /// Response arrived without an `SCM_RIGHTS` record
    #[error("cmsg: bad message: no descriptor attached")]
    MissingDescriptor,

    /// Response carried more than one descriptor
    #[error("cmsg: bad message: expected 1 descriptor, got {0}")]
    TooManyDescriptors(usize),

    /// Ancillary data of a level/type other than `SOL_SOCKET`/`SCM_RIGHTS`
    #[error("cmsg: bad message: unexpected control message")]
    UnexpectedControlMessage,

    /// Peer closed the connection before a response arrived
    #[error("broker closed the connection")]
    ConnectionClosed,
}

/// Top-level error for broker and client operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{context}: {source}")]
    Sys {
        context: &'static str,
        #[source]
        source: nix::Error,
    },

    /// The datagram relay loop has no implementation yet
    #[error("datagram relay loop is not implemented")]
    RelayUnimplemented,
}

impl BrokerError {
    /// Wrap a failed system call with the name of the operation
    pub fn sys(context: &'static str, source: nix::Error) -> Self {
        BrokerError::Sys { context, source }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            BrokerError::Config(_) => EXIT_CONFIG,
            BrokerError::Protocol(_) => EXIT_PROTOCOL,
            BrokerError::Io(_) | BrokerError::Sys { .. } | BrokerError::RelayUnimplemented => {
                EXIT_FAILURE
            }
        }
    }

    /// Stable machine-readable code, used in log lines
    pub fn error_code(&self) -> &'static str {
        match self {
            BrokerError::Config(ConfigError::MissingSocketPath) => "CONFIG_MISSING_PATH",
            BrokerError::Config(ConfigError::SocketPathTooLong { .. }) => "CONFIG_PATH_TOO_LONG",
            BrokerError::Config(ConfigError::InvalidAddress(_)) => "CONFIG_INVALID_ADDRESS",
            BrokerError::Config(ConfigError::InvalidPort(_)) => "CONFIG_INVALID_PORT",
            BrokerError::Config(ConfigError::ZeroCapacity) => "CONFIG_ZERO_CAPACITY",
            BrokerError::Protocol(ProtocolError::InvalidTag(_)) => "PROTOCOL_INVALID_TAG",
            BrokerError::Protocol(ProtocolError::ConnectionClosed) => "PROTOCOL_CLOSED",
            BrokerError::Protocol(_) => "PROTOCOL_BAD_CMSG",
            BrokerError::Io(_) => "IO",
            BrokerError::Sys { .. } => "SYSCALL",
            BrokerError::RelayUnimplemented => "RELAY_UNIMPLEMENTED",
        }
    }
}

/// Exit code for an error that reached `main`
///
/// Walks the `anyhow` chain so that a typed error wrapped in context still
/// yields its own code.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<BrokerError>() {
            return e.exit_code();
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_CONFIG;
        }
        if cause.downcast_ref::<ProtocolError>().is_some() {
            return EXIT_PROTOCOL;
        }
    }
    EXIT_FAILURE
}
