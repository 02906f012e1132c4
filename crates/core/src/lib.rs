pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod types;

pub use error::{ParleyError, Result};
pub use types::{
    DeliveryState, Message, MessageId, PresenceEntry, ReadStateSink, Session, UnreadSnapshot,
    WireMessage,
};
