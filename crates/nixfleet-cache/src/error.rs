use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nixfleet_core::CoreError;
use nixfleet_state::StateError;
use tracing::error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("not found")]
    NotFound,

    #[error("invalid cache options: {0}")]
    InvalidOptions(String),

    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("narinfo: {0}")]
    NarInfo(#[from] CoreError),

    #[error("narinfo '{hash}' kept changing while signing ({attempts} attempts)")]
    SignContention { hash: String, attempts: u32 },

    #[error("upstream {url}: {message}")]
    Upstream { url: String, message: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("server: {0}")]
    Serve(#[from] std::io::Error),
}

/// Cache clients only look at the status code, so every error response
/// has an empty body. Failed upstream fetches are server errors, not misses.
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        match self {
            CacheError::NotFound => StatusCode::NOT_FOUND.into_response(),
            other => {
                error!(error = %other, "cache request failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
