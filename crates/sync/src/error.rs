use parley_core::session::SessionError;
use parley_transport::ConnectionError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("not logged in")]
    NotAuthenticated,

    #[error("no conversation is open")]
    NoActivePeer,

    #[error("message is empty")]
    EmptyMessage,

    #[error("connectivity error: {0}")]
    Connectivity(#[from] ConnectionError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl SyncError {
    /// Whether the caller should send the user back to login.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::NotAuthenticated)
    }
}
