//! Errors seen by [`ControlClient`](crate::ControlClient) callers.

use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid dispatcher url '{0}'")]
    InvalidUrl(String),

    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The dispatcher refused a record over its bucket limit.
    #[error("rejected as too large: {0}")]
    TooLarge(String),

    #[error("dispatcher answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ApiError {
    pub fn is_too_large(&self) -> bool {
        matches!(self, ApiError::TooLarge(_))
    }
}
