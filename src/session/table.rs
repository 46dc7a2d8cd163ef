//! Peer-address to forwarding-socket table
//!
//! UDP has no connections, so replies can only be routed back to the right
//! client if every client address gets its own forwarding socket. This table
//! holds those sockets in a fixed number of slots and evicts the entry with
//! the oldest recency marker when it runs out of room.
//!
//! The table is small (8 slots by default), so every lookup is a linear
//! scan over the slot array rather than a hash lookup. Ties between equal
//! markers go to the lowest slot index.

use crate::error::ConfigError;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Default number of session slots
pub const DEFAULT_CAPACITY: usize = 8;

/// When the recency marker of an entry is refreshed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecencyPolicy {
    /// Refresh on insertion and on every access; evicts the least recently used
    #[default]
    LeastRecentlyUsed,
    /// Refresh on insertion only; evicts the oldest insertion
    InsertionOrder,
}

/// One peer's session
pub struct SessionEntry {
    peer: SocketAddr,
    socket: OwnedFd,
    last_access: u64,
}

impl SessionEntry {
    /// Remote peer address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Forwarding socket dedicated to this peer
    pub fn socket(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Logical time of the last refresh
    pub fn last_access(&self) -> u64 {
        self.last_access
    }
}

impl fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEntry")
            .field("peer", &self.peer)
            .field("fd", &self.socket.as_raw_fd())
            .field("last_access", &self.last_access)
            .finish()
    }
}

/// Result of [`SessionTable::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insertion {
    /// Slot the new entry was written to
    pub slot: usize,
    /// Forwarding socket now owned by that slot
    pub fd: RawFd,
    /// Peer whose entry was evicted (its socket is already closed)
    pub evicted: Option<SocketAddr>,
    /// Whether an existing entry for the same peer was replaced
    pub replaced: bool,
}

/// Fixed-capacity session table
pub struct SessionTable {
    slots: Box<[Option<SessionEntry>]>,
    clock: u64,
    policy: RecencyPolicy,
}

impl SessionTable {
    /// Create an empty table with `capacity` slots and LRU eviction
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        Self::with_policy(capacity, RecencyPolicy::default())
    }

    /// Create an empty table with an explicit recency policy
    pub fn with_policy(capacity: usize, policy: RecencyPolicy) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(Self::empty(capacity, policy))
    }

    /// Caller guarantees `capacity > 0`
    fn empty(capacity: usize, policy: RecencyPolicy) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            clock: 0,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    pub fn policy(&self) -> RecencyPolicy {
        self.policy
    }

    /// Slot holding `peer`, compared by family, port and address bits
    pub fn find_by_peer(&self, peer: &SocketAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.peer == *peer))
    }

    /// Slot whose forwarding socket is `fd`
    ///
    /// Used to map a reply that arrived on a forwarding socket back to the
    /// peer it belongs to.
    pub fn find_by_descriptor(&self, fd: RawFd) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.socket.as_raw_fd() == fd))
    }

    /// Occupied slot with the smallest recency marker, first one on ties
    pub fn evict_candidate(&self) -> Option<usize> {
        let mut candidate: Option<(usize, u64)> = None;
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some(entry) = entry {
                match candidate {
                    Some((_, min)) if entry.last_access >= min => {}
                    _ => candidate = Some((slot, entry.last_access)),
                }
            }
        }
        candidate.map(|(slot, _)| slot)
    }

    /// Add a session for `peer`
    ///
    /// An existing entry for the same peer has its socket replaced (the old
    /// one is closed). Otherwise the entry goes into a free slot; when the
    /// table is full the eviction candidate is removed and its socket closed
    /// before the new entry is written.
    pub fn insert(&mut self, peer: SocketAddr, socket: OwnedFd) -> Insertion {
        let now = self.tick();
        let fd = socket.as_raw_fd();
        let entry = SessionEntry {
            peer,
            socket,
            last_access: now,
        };

        if let Some(slot) = self.find_by_peer(&peer) {
            self.slots[slot] = Some(entry);
            return Insertion {
                slot,
                fd,
                evicted: None,
                replaced: true,
            };
        }

        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(entry);
            return Insertion {
                slot,
                fd,
                evicted: None,
                replaced: false,
            };
        }

        // Full: capacity is non-zero, so there is always a candidate
        let slot = self.evict_candidate().unwrap_or(0);
        let evicted = self.slots[slot].take().map(|old| {
            log::debug!("evicting session for {} (fd {})", old.peer, old.socket.as_raw_fd());
            old.peer
        });
        self.slots[slot] = Some(entry);
        Insertion {
            slot,
            fd,
            evicted,
            replaced: false,
        }
    }

    /// Record traffic on `slot`; returns `false` for an empty slot
    pub fn touch(&mut self, slot: usize) -> bool {
        if self.slots.get(slot).map_or(true, Option::is_none) {
            return false;
        }
        if self.policy == RecencyPolicy::LeastRecentlyUsed {
            let now = self.tick();
            if let Some(Some(entry)) = self.slots.get_mut(slot) {
                entry.last_access = now;
            }
        }
        true
    }

    /// Forwarding socket for `peer`, counting as an access
    pub fn lookup(&mut self, peer: &SocketAddr) -> Option<BorrowedFd<'_>> {
        let slot = self.find_by_peer(peer)?;
        self.touch(slot);
        self.get(slot).map(SessionEntry::socket)
    }

    /// Peer owning forwarding socket `fd`, counting as an access
    pub fn lookup_by_descriptor(&mut self, fd: RawFd) -> Option<SocketAddr> {
        let slot = self.find_by_descriptor(fd)?;
        self.touch(slot);
        self.get(slot).map(SessionEntry::peer)
    }

    pub fn get(&self, slot: usize) -> Option<&SessionEntry> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Remove the entry in `slot`; dropping the result closes its socket
    pub fn remove(&mut self, slot: usize) -> Option<SessionEntry> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    /// Occupied slots with their entries, in slot order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &SessionEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|e| (slot, e)))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::empty(DEFAULT_CAPACITY, RecencyPolicy::default())
    }
}

impl fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTable")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("policy", &self.policy)
            .field("entries", &self.iter().map(|(_, e)| e).collect::<Vec<_>>())
            .finish()
    }
}
