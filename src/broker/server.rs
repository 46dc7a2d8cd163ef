//! Broker daemon: Unix socket listener and fork-per-connection handlers
//!
//! The parent only accepts. Every accepted connection is handed to a freshly
//! forked handler process that speaks the fd handoff protocol until the peer
//! hangs up. Handlers share no state with each other or with the parent, and
//! `SIGCHLD` is ignored so the kernel reaps them without `waitpid`.

use crate::broker::config::BrokerConfig;
use crate::broker::protocol::{send_fd, SocketKind};
use crate::error::{BrokerError, EXIT_SUCCESS};
use crate::signal::{self, RendezvousCleanup, SignalHandler};
use anyhow::{anyhow, bail, Context, Result};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{fork, ForkResult};
use std::fs;
use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

/// Sleep between non-blocking accept attempts when nothing is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Back-off after a failed accept
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Privileged socket broker
pub struct BrokerServer {
    config: BrokerConfig,
    listener: Option<UnixListener>,
    cleanup: Option<RendezvousCleanup>,
}

impl BrokerServer {
    /// Create a broker for a validated configuration
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            listener: None,
            cleanup: None,
        }
    }

    /// Rendezvous path this broker listens on
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Start the broker: install signal handling, bind, and accept forever
    ///
    /// Returns only on error. On SIGINT/SIGTERM the rendezvous path is
    /// removed and the signal is re-raised with its default action.
    pub fn start(&mut self) -> Result<()> {
        let signals = SignalHandler::register().context("install signal handlers")?;
        signal::ignore_children().context("ignore SIGCHLD")?;

        self.bind()?;
        log::info!("start listening on '{}'", self.socket_path().display());

        let sig = self.accept_loop(&signals)?;

        if let Some(cleanup) = &self.cleanup {
            cleanup.run();
        }
        signals.unregister();
        SignalHandler::reraise(sig).context("re-raise shutdown signal")?;
        Ok(())
    }

    /// Bind the rendezvous socket
    ///
    /// A leftover socket file nobody is listening on is removed first; a live
    /// one means another broker owns the path. Anything at the path that is
    /// not a socket is left alone and binding fails.
    pub fn bind(&mut self) -> Result<()> {
        let path = self.config.socket_path.clone();

        match fs::symlink_metadata(&path) {
            Ok(meta) if !meta.file_type().is_socket() => {
                bail!("'{}' exists and is not a socket", path.display());
            }
            Ok(_) => {
                if UnixStream::connect(&path).is_ok() {
                    bail!("broker already listening on '{}'", path.display());
                }
                log::debug!("removing stale socket '{}'", path.display());
                fs::remove_file(&path)
                    .with_context(|| format!("remove stale socket '{}'", path.display()))?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("stat '{}'", path.display()));
            }
        }

        // No group/other access from the moment the socket file exists
        let old_mask = umask(Mode::from_bits_truncate(0o077));
        let bound = UnixListener::bind(&path);
        umask(old_mask);
        let listener = bound.with_context(|| format!("bind '{}'", path.display()))?;
        self.cleanup = Some(RendezvousCleanup::new(&path));

        // Set socket permissions to 0600 (owner read/write only)
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&path, perms)?;
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Accept until a shutdown signal arrives; returns that signal
    fn accept_loop(&mut self, signals: &SignalHandler) -> Result<i32> {
        let listener = self.listener.take()
            .ok_or_else(|| anyhow!("Socket not bound"))?;

        // Non-blocking so the loop can notice pending signals
        listener.set_nonblocking(true)?;

        loop {
            if let Some(sig) = signals.pending() {
                log::debug!("received signal {}", sig);
                return Ok(sig);
            }

            let stream = match listener.accept() {
                Ok((stream, _addr)) => stream,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    std::thread::sleep(ACCEPT_ERROR_BACKOFF);
                    continue;
                }
            };

            if let Err(e) = self.prepare_stream(&stream) {
                log::warn!("dropping connection: {}", e);
                continue;
            }

            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => {
                    log::debug!("accepted connection, handler pid {}", child);
                    // The handler owns the connection now
                    drop(stream);
                }
                Ok(ForkResult::Child) => {
                    drop(listener);
                    Self::run_handler(stream);
                }
                Err(e) => {
                    log::warn!("fork failed, dropping connection: {}", e);
                }
            }
        }
    }

    /// Blocking mode plus the configured idle timeout
    fn prepare_stream(&self, stream: &UnixStream) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(self.config.read_timeout)
    }

    /// Body of a forked handler process
    fn run_handler(stream: UnixStream) -> ! {
        if let Err(e) = signal::reset_in_child() {
            log::warn!("failed to reset signal dispositions: {}", e);
        }

        let code = match Self::handle_connection(stream) {
            Ok(served) => {
                log::debug!("peer closed after {} handoffs", served);
                EXIT_SUCCESS
            }
            Err(e) => {
                log::error!("{} ({})", e, e.error_code());
                e.exit_code()
            }
        };

        std::process::exit(i32::from(code));
    }

    /// Serve handoff requests on one connection until the peer closes
    ///
    /// Returns the number of descriptors handed off. Any protocol violation
    /// ends the exchange with an error and the connection is dropped without
    /// a reply. Runs in-process, so it can also be driven over a
    /// `UnixStream::pair` without forking.
    pub fn handle_connection(mut stream: UnixStream) -> Result<u64, BrokerError> {
        let mut served = 0u64;

        loop {
            let mut tag = [0u8; 1];
            match stream.read(&mut tag) {
                Ok(0) => return Ok(served),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    log::debug!("connection idle past read timeout, closing");
                    return Ok(served);
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(served),
                Err(e) => return Err(e.into()),
            }

            let kind = SocketKind::from_tag(tag[0])?;
            let fd = kind.create()?;
            log::debug!("handing off {} socket (fd {})", kind, fd.as_raw_fd());
            send_fd(&stream, fd)?;
            served += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::{recv_fd, TAG_DATAGRAM, TAG_STREAM};
    use crate::error::ProtocolError;
    use nix::sys::socket::{getsockopt, sockopt, SockType};
    use std::io::Write;
    use std::thread;
    use tempfile::TempDir;

    fn spawn_handler() -> (UnixStream, thread::JoinHandle<Result<u64, BrokerError>>) {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || BrokerServer::handle_connection(server));
        (client, handle)
    }

    #[test]
    fn test_datagram_request() {
        let (mut client, handle) = spawn_handler();
        client.write_all(&[TAG_DATAGRAM]).unwrap();
        let fd = recv_fd(&client).unwrap();
        assert_eq!(getsockopt(&fd, sockopt::SockType).unwrap(), SockType::Datagram);

        drop(client);
        assert_eq!(handle.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_sequential_requests_yield_independent_sockets() {
        let (mut client, handle) = spawn_handler();
        let mut fds = Vec::new();
        for tag in [TAG_STREAM, TAG_DATAGRAM, TAG_DATAGRAM] {
            client.write_all(&[tag]).unwrap();
            fds.push(recv_fd(&client).unwrap());
        }

        assert_eq!(getsockopt(&fds[0], sockopt::SockType).unwrap(), SockType::Stream);
        assert_ne!(fds[1].as_raw_fd(), fds[2].as_raw_fd());

        // Closing one leaves the others usable
        let last = fds.pop().unwrap();
        drop(fds);
        let udp = std::net::UdpSocket::from(last);
        assert!(udp.local_addr().is_ok());

        drop(client);
        assert_eq!(handle.join().unwrap().unwrap(), 3);
    }

    #[test]
    fn test_invalid_tag_closes_without_descriptor() {
        let (mut client, handle) = spawn_handler();
        client.write_all(&[99]).unwrap();

        match handle.join().unwrap() {
            Err(BrokerError::Protocol(ProtocolError::InvalidTag(99))) => {}
            other => panic!("expected InvalidTag(99), got {:?}", other),
        }
        match recv_fd(&client) {
            Err(BrokerError::Protocol(ProtocolError::ConnectionClosed)) => {}
            other => panic!("expected ConnectionClosed, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_tag_after_valid_request() {
        let (mut client, handle) = spawn_handler();
        client.write_all(&[TAG_DATAGRAM]).unwrap();
        let fd = recv_fd(&client).unwrap();
        assert_eq!(getsockopt(&fd, sockopt::SockType).unwrap(), SockType::Datagram);

        client.write_all(&[99]).unwrap();
        assert!(handle.join().unwrap().is_err());
        assert!(recv_fd(&client).is_err());
    }

    #[test]
    fn test_immediate_close_serves_nothing() {
        let (client, handle) = spawn_handler();
        drop(client);
        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_read_timeout_ends_handler() {
        let (client, server) = UnixStream::pair().unwrap();
        server.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let served = BrokerServer::handle_connection(server).unwrap();
        assert_eq!(served, 0);
        drop(client);
    }

    #[test]
    fn test_bind_creates_private_socket() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broker.sock");
        let mut server = BrokerServer::new(BrokerConfig::new(&path).unwrap());
        server.bind().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broker.sock");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let mut server = BrokerServer::new(BrokerConfig::new(&path).unwrap());
        server.bind().unwrap();
        assert!(UnixStream::connect(&path).is_ok());
    }

    #[test]
    fn test_bind_refuses_live_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broker.sock");
        let _live = UnixListener::bind(&path).unwrap();

        let mut server = BrokerServer::new(BrokerConfig::new(&path).unwrap());
        let err = server.bind().unwrap_err();
        assert!(err.to_string().contains("already listening"));
    }

    #[test]
    fn test_bind_keeps_regular_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("important.conf");
        fs::write(&path, b"precious data").unwrap();

        let mut server = BrokerServer::new(BrokerConfig::new(&path).unwrap());
        let err = server.bind().unwrap_err();
        assert!(err.to_string().contains("not a socket"));
        assert_eq!(fs::read(&path).unwrap(), b"precious data");

        // Nothing was bound, so dropping the server must not unlink the file
        drop(server);
        assert!(path.exists());
    }

    #[test]
    fn test_bind_keeps_symlink() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.conf");
        let link = dir.path().join("broker.sock");
        fs::write(&target, b"keep").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut server = BrokerServer::new(BrokerConfig::new(&link).unwrap());
        assert!(server.bind().is_err());
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&target).unwrap(), b"keep");
    }
}
