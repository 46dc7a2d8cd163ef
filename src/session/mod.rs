//! Client-side datagram sessions
//!
//! - `table`: fixed-capacity peer → forwarding socket map with recency eviction
//! - `proxy`: the table wired to a broker connection for on-demand sockets

pub mod table;
pub mod proxy;

pub use table::{SessionTable, SessionEntry, Insertion, RecencyPolicy, DEFAULT_CAPACITY};
pub use proxy::{ProxySessions, SocketSource};
