//! Errors returned by the record store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock already held")]
    Held,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("failed to (de)serialize record: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
