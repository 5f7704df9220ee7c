//! Errors returned by the secret store client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found at {0}")]
    NotFound(String),

    #[error("request to secret backend failed: {0}")]
    Request(String),

    #[error("secret backend returned an error: {0}")]
    Backend(String),

    #[error("failed to parse secret response: {0}")]
    Parse(String),

    #[error("field {field} not present in secret {path}")]
    FieldMissing { path: String, field: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;
