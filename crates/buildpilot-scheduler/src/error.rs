//! Errors returned by the scheduler adapter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("timeout waiting for {0} to complete")]
    Timeout(String),

    #[error("scheduler job {0} failed: {1}")]
    JobFailed(String, String),

    #[error("cancelled")]
    Cancelled,

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
