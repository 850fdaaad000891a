//! Connections, their registry, and the TCP transports that drive them.

pub mod client;
pub mod connection;
pub mod factory;
pub mod registry;
pub mod server;

pub use client::{ClientConnection, TcpClient};
pub use connection::{Connection, ConnectionHandle};
pub use factory::{ExpiryConfig, FactoryConfig, PeerAdaptor, ProtocolFactory};
pub use registry::ConnectionRegistry;
pub use server::TcpServer;
