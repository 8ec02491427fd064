/// Realtime layer: wire format, connection lifecycle, broadcast channels and the hub
pub mod broadcast;
pub mod connection;
pub mod hub;
pub mod protocol;
pub mod tcp;

pub use connection::{ConnectionHandle, ConnectionManager, ConnectionState, Connector};
pub use hub::Hub;
pub use tcp::TcpConnector;
