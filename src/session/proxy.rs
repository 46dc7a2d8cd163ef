//! Session table backed by the socket broker
//!
//! On a table miss for a new peer, a fresh datagram socket is requested from
//! the broker and inserted, evicting the least recently used peer if the
//! table is full. The table keeps ownership of every forwarding socket;
//! callers borrow it for as long as no other session can be created.

use crate::broker::BrokerClient;
use crate::error::BrokerError;
use crate::session::table::{SessionEntry, SessionTable};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

/// Where forwarding sockets come from
pub trait SocketSource {
    /// A fresh, unbound datagram socket owned by the caller
    fn datagram_socket(&mut self) -> Result<OwnedFd, BrokerError>;
}

impl SocketSource for BrokerClient {
    fn datagram_socket(&mut self) -> Result<OwnedFd, BrokerError> {
        self.request_datagram()
    }
}

/// Per-peer forwarding sockets for the proxy client
#[derive(Debug)]
pub struct ProxySessions<S: SocketSource> {
    table: SessionTable,
    source: S,
}

impl<S: SocketSource> ProxySessions<S> {
    pub fn new(table: SessionTable, source: S) -> Self {
        Self { table, source }
    }

    /// Forwarding socket for `peer`, creating a session on first contact
    ///
    /// The returned handle borrows the sessions mutably, so it cannot outlive
    /// the next call that might evict it. A broker failure leaves the table
    /// untouched.
    pub fn session_for(&mut self, peer: SocketAddr) -> Result<BorrowedFd<'_>, BrokerError> {
        let slot = match self.table.find_by_peer(&peer) {
            Some(slot) => {
                self.table.touch(slot);
                slot
            }
            None => {
                let socket = self.source.datagram_socket()?;
                let inserted = self.table.insert(peer, socket);
                match inserted.evicted {
                    Some(old) => log::debug!(
                        "new session for {} in slot {} (evicted {})",
                        peer, inserted.slot, old
                    ),
                    None => log::debug!("new session for {} in slot {}", peer, inserted.slot),
                }
                inserted.slot
            }
        };

        // The slot was found or filled above
        self.table
            .get(slot)
            .map(SessionEntry::socket)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound).into())
    }

    /// Peer a reply on forwarding socket `fd` belongs to
    pub fn peer_for(&mut self, fd: RawFd) -> Option<SocketAddr> {
        self.table.lookup_by_descriptor(fd)
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}
