//! Error taxonomy shared across the RPC surface, the pipeline engine and the CLI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Contention(String),

    #[error("timeout: {0}")]
    SchedulerTimeout(String),

    #[error("scheduler job failed: {0}")]
    SchedulerFailure(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
