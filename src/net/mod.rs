//! LAN peer discovery and stream negotiation

pub mod connection;
pub mod streaming;
pub mod toolkit;

pub use connection::{Connection, ConnectionInfo};
pub use streaming::Streaming;
pub use toolkit::StreamProtocol;
