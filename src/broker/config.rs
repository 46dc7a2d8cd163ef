//! Broker configuration
//!
//! The rendezvous path is the only required setting. It must fit in
//! `sockaddr_un.sun_path` including the trailing NUL, so at most 107 bytes
//! on Linux. Paths longer than that are rejected before anything is bound.

use crate::error::ConfigError;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest rendezvous path accepted, in bytes
pub const MAX_SOCKET_PATH: usize = SUN_PATH_LEN - 1;

/// Size of `sockaddr_un.sun_path`
#[cfg(any(target_os = "linux", target_os = "android"))]
const SUN_PATH_LEN: usize = 108;

/// Size of `sockaddr_un.sun_path` (macOS and the BSDs)
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SUN_PATH_LEN: usize = 104;

/// Validate a rendezvous path for binding or connecting
pub fn validate_socket_path(path: &Path) -> Result<(), ConfigError> {
    let len = path.as_os_str().as_bytes().len();
    if len == 0 {
        return Err(ConfigError::MissingSocketPath);
    }
    if len > MAX_SOCKET_PATH {
        return Err(ConfigError::SocketPathTooLong {
            len,
            max: MAX_SOCKET_PATH,
        });
    }
    Ok(())
}

/// Complete broker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Filesystem path of the listening Unix socket
    pub socket_path: PathBuf,
    /// Idle read timeout per connection; `None` waits forever
    pub read_timeout: Option<Duration>,
}

impl BrokerConfig {
    /// Build a validated configuration
    pub fn new(socket_path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let socket_path = socket_path.into();
        validate_socket_path(&socket_path)?;
        Ok(Self {
            socket_path,
            read_timeout: None,
        })
    }

    /// Drop connections that stay silent for longer than `timeout`
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout.filter(|t| !t.is_zero());
        self
    }
}
