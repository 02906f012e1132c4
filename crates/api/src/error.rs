#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("invalid api url: {0}")]
    InvalidUrl(String),
}
