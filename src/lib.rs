//! An interruption-transparent WebSocket reverse proxy.
//!
//! `pontoon` bridges long-lived client WebSocket connections to a pool of
//! backend WebSocket servers. When a backend fails mid-session the proxy
//! acquires a replacement from the pool and splices it under the running
//! connection, staging client bytes in a bounded in-memory buffer in the
//! meantime. The client never observes a disconnect, as long as a
//! replacement arrives before the staging buffer fills.
//!
//! The bridging core is byte-opaque: frames are never parsed, and the
//! WebSocket protocol appears only at the edges, in the opening handshakes.

pub mod cli;
pub mod config;
pub mod defaults;
pub mod manager;
pub mod pipe;
pub mod pool;
pub mod server;
pub mod transport;

mod util;

pub use config::Config;
pub use manager::PipeManager;
pub use pipe::PipeError;
pub use pool::{BackendPool, RegisterError};
pub use server::Server;
pub use transport::BackendAddress;
