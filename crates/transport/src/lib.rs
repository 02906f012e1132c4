pub mod connection;
pub mod error;
pub mod transport;
pub mod wire;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, Identity};
pub use error::{ConnectionError, WireError};
pub use transport::{ChannelTransport, ConnectionConfig, WebSocketTransport};
pub use wire::{InboundEvent, OutboundEvent, Packet};
