//! Error types for the cache.

use crate::types::{QuerySpec, RemoteError};
use crate::subscriptions::ListenerKind;
use thiserror::Error;

/// Main error type for cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Listener already registered on {query} ({kind:?})")]
    DuplicateListener { query: QuerySpec, kind: ListenerKind },

    #[error("Attempting to unsubscribe with 0 {kind:?} subscriptions: {query}")]
    SubscriptionUnderflow { query: QuerySpec, kind: ListenerKind },

    #[error("Detach without a matching attach on {0}")]
    GateUnderflow(String),

    #[error("Key must be a valid JSON value (number, string or boolean), got: {0}")]
    UnsupportedKeyType(String),

    #[error("Cache for {query} was created for a different key or entity type")]
    TypeMismatch { query: QuerySpec },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Deserialization(e.to_string())
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
