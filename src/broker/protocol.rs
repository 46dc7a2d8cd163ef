//! Fd handoff protocol
//!
//! A strictly half-duplex exchange, repeatable on one connection:
//!
//! ```text
//! client                              broker
//!   │ ── [1 byte: socket type tag] ──►  │
//!   │                                   │ socket(AF_INET, type, 0)
//!   │ ◄── [1 byte: 0x00] + SCM_RIGHTS ──│ close(own copy)
//! ```
//!
//! The tag values are the Linux socket-type constants, so
//! `SOCK_STREAM` (1) asks for a TCP socket and `SOCK_DGRAM` (2) for a UDP
//! socket. Any other tag is a protocol violation and the broker drops the
//! connection without replying.
//!
//! The response must carry exactly one byte of ordinary payload because
//! ancillary data cannot travel on its own over a stream socket.

use crate::error::{BrokerError, ProtocolError};
use nix::sys::socket::{
    self, sendmsg, recvmsg, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Tag byte requesting a stream socket
pub const TAG_STREAM: u8 = libc::SOCK_STREAM as u8;

/// Tag byte requesting a datagram socket
pub const TAG_DATAGRAM: u8 = libc::SOCK_DGRAM as u8;

/// Placeholder payload sent alongside the descriptor
pub const RESPONSE_PAYLOAD: u8 = 0;

/// Room for a few descriptors so that an oversized response is detected
/// rather than silently truncated by the kernel
const MAX_RECV_FDS: usize = 4;

/// Socket type requested from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// `SOCK_STREAM` on `AF_INET`
    Stream,
    /// `SOCK_DGRAM` on `AF_INET`
    Datagram,
}

impl SocketKind {
    /// Decode a request tag byte
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            TAG_STREAM => Ok(SocketKind::Stream),
            TAG_DATAGRAM => Ok(SocketKind::Datagram),
            other => Err(ProtocolError::InvalidTag(other)),
        }
    }

    /// Encode as a request tag byte
    pub fn tag(self) -> u8 {
        match self {
            SocketKind::Stream => TAG_STREAM,
            SocketKind::Datagram => TAG_DATAGRAM,
        }
    }

    /// Matching nix socket type
    pub fn sock_type(self) -> SockType {
        match self {
            SocketKind::Stream => SockType::Stream,
            SocketKind::Datagram => SockType::Datagram,
        }
    }

    /// Create a fresh, unbound `AF_INET` socket of this kind
    pub fn create(self) -> Result<OwnedFd, BrokerError> {
        socket::socket(
            AddressFamily::Inet,
            self.sock_type(),
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| BrokerError::sys("socket", e))
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Stream => write!(f, "stream"),
            SocketKind::Datagram => write!(f, "datagram"),
        }
    }
}

/// Send one descriptor over a Unix stream using `SCM_RIGHTS`
///
/// Takes the descriptor by value: once the kernel has queued it for the
/// peer, our copy is closed on return.
pub fn send_fd<S: AsRawFd>(socket: &S, fd: OwnedFd) -> Result<(), BrokerError> {
    let payload = [RESPONSE_PAYLOAD];
    let iov = [IoSlice::new(&payload)];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    loop {
        match sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
            Ok(_) => break,
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(BrokerError::sys("sendmsg", e)),
        }
    }

    drop(fd);
    Ok(())
}

/// Receive exactly one descriptor sent with [`send_fd`]
///
/// A clean EOF is reported as [`ProtocolError::ConnectionClosed`]. Anything
/// other than a single `SCM_RIGHTS` record holding a single descriptor is a
/// protocol error; descriptors that did arrive are closed before returning.
pub fn recv_fd<S: AsRawFd>(socket: &S) -> Result<OwnedFd, BrokerError> {
    let mut payload = [0u8; 1];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_RECV_FDS]);

    let (bytes, truncated, mut received, unexpected) = loop {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let msg = match recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(BrokerError::sys("recvmsg", e)),
        };

        let mut received: Vec<OwnedFd> = Vec::new();
        let mut unexpected = false;
        let cmsgs = msg.cmsgs().map_err(|e| BrokerError::sys("recvmsg", e))?;
        for cmsg in cmsgs {
            match cmsg {
                ControlMessageOwned::ScmRights(fds) => {
                    // SAFETY: the kernel just installed these descriptors in
                    // our table and nothing else refers to them yet.
                    received.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
                _ => unexpected = true,
            }
        }

        break (
            msg.bytes,
            msg.flags.contains(MsgFlags::MSG_CTRUNC),
            received,
            unexpected,
        );
    };

    if bytes == 0 && received.is_empty() {
        return Err(ProtocolError::ConnectionClosed.into());
    }
    if unexpected {
        return Err(ProtocolError::UnexpectedControlMessage.into());
    }
    if truncated && !received.is_empty() {
        return Err(ProtocolError::TooManyDescriptors(received.len() + 1).into());
    }

    match received.len() {
        0 => Err(ProtocolError::MissingDescriptor.into()),
        1 => Ok(received.remove(0)),
        n => Err(ProtocolError::TooManyDescriptors(n).into()),
    }
}
