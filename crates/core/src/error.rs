use serde::{Deserialize, Serialize};

use crate::Version;

/// Errors surfaced by the backend, the broadcaster, the index and the server.
/// Serializable so they can cross a transport unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ResourceError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {key}: expected version {expected}, found {actual}")]
    Conflict { key: String, expected: Version, actual: Version },
    #[error("storage: {0}")]
    Storage(String),
    #[error("slow_consumer: subscriber {0} fell behind and was disconnected")]
    SlowConsumer(u64),
    #[error("index_not_ready: {0}")]
    IndexNotReady(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("closed: {0}")]
    Closed(String),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

impl ResourceError {
    /// Wrap a provider failure, keeping the whole context chain.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        ResourceError::Storage(format!("{:#}", err))
    }

    /// Transient failures a caller may retry without changing the request.
    /// A timed-out write may still have committed; retry it conditionally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResourceError::Storage(_) | ResourceError::Timeout(_))
    }
}
