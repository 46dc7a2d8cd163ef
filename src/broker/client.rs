//! Broker client
//!
//! Connects to a running broker and requests sockets one at a time. Each
//! request blocks until the descriptor arrives or the broker drops the
//! connection, which is the only failure signal the protocol has.

use crate::broker::config::validate_socket_path;
use crate::broker::protocol::{recv_fd, SocketKind};
use crate::error::BrokerError;
use std::io::{ErrorKind, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection to the socket broker
#[derive(Debug)]
pub struct BrokerClient {
    socket_path: PathBuf,
    stream: UnixStream,
    requests: u64,
}

impl BrokerClient {
    /// Connect to the broker listening on `path`
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let path = path.as_ref();
        validate_socket_path(path)?;
        let stream = UnixStream::connect(path)?;
        log::debug!("connected to broker at '{}'", path.display());
        Ok(Self::from_stream(path, stream))
    }

    /// Wrap an already connected stream
    pub fn from_stream(path: impl Into<PathBuf>, stream: UnixStream) -> Self {
        Self {
            socket_path: path.into(),
            stream,
            requests: 0,
        }
    }

    /// Bound how long a single request may wait for its response
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), BrokerError> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Path of the broker socket
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of descriptors received on this connection
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Request a fresh socket of the given kind
    ///
    /// The returned descriptor is unbound and owned by the caller.
    pub fn request(&mut self, kind: SocketKind) -> Result<OwnedFd, BrokerError> {
        let tag = [kind.tag()];
        loop {
            match self.stream.write(&tag) {
                Ok(1) => break,
                Ok(_) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let fd = recv_fd(&self.stream)?;
        self.requests += 1;
        log::debug!("received {} socket from broker", kind);
        Ok(fd)
    }

    /// Request a fresh datagram socket
    pub fn request_datagram(&mut self) -> Result<OwnedFd, BrokerError> {
        self.request(SocketKind::Datagram)
    }

    /// Request a fresh stream socket
    pub fn request_stream(&mut self) -> Result<OwnedFd, BrokerError> {
        self.request(SocketKind::Stream)
    }
}
