//! SOCKS5-over-HTTP tunneling proxy.
//!
//! Two roles share this crate: the client (`soht-client`) exposes a local
//! SOCKS5 port and relays each connection as encrypted HTTP upload/download
//! traffic toward a pool of server endpoints; the server (`soht-server`)
//! reassembles the stream, dials the real destination, and relays bytes
//! back through long-polled downloads.

pub mod buffer_pool;
pub mod config;
pub mod crypto;
pub mod frame;
pub mod pool;
pub mod server;
pub mod session;
pub mod socks;
pub mod transport;
