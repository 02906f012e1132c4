#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("connection timed out")]
    Timeout,

    #[error("server rejected the connection: {0}")]
    Rejected(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("not connected")]
    NotConnected,

    #[error("gave up after {attempts} connection attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::Timeout | Self::Closed(_) | Self::Transport(_)
        )
    }
}

/// A frame that could not be turned into a known event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unknown packet type {0:?}")]
    UnknownPacket(char),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

impl From<serde_json::Error> for WireError {
    fn from(error: serde_json::Error) -> Self {
        Self::Malformed(error.to_string())
    }
}
