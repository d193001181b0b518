use nixfleet_api::ApiError;
use nixfleet_cache::CacheError;
use nixfleet_state::StateError;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("cache proxy: {0}")]
    Cache(#[from] CacheError),

    #[error("dispatcher: {0}")]
    Api(#[from] ApiError),

    #[error("{step} failed: {message}")]
    Command { step: &'static str, message: String },

    #[error("cache proxy stopped before the deployment finished")]
    ProxyStopped,

    #[error("cache proxy has no listen address")]
    ProxyNotBound,

    #[error("desired-state feed closed")]
    FeedClosed,
}

impl AgentError {
    /// The record was refused for exceeding the result bucket's limit.
    pub fn is_too_large(&self) -> bool {
        match self {
            AgentError::State(StateError::ValueTooLarge { .. }) => true,
            AgentError::Api(e) => e.is_too_large(),
            _ => false,
        }
    }
}
