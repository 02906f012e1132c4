pub type Result<T> = std::result::Result<T, ParleyError>;

#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("event bus channel closed")]
    ChannelClosed,

    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),
}
