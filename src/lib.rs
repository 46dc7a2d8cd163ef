// Library interface for the socket broker
// This allows integration tests and benchmarks to access internal modules

pub mod broker;
pub mod session;
pub mod proxy;
pub mod signal;
pub mod error;
pub mod logging;
