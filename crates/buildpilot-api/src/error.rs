//! JSON-RPC 2.0 error codes and the mapping from domain errors to them.

use buildpilot_core::Error as CoreError;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("unknown method: {method}"))
    }
}

/// Validation/NotFound/InvalidState/Contention are all caller-facing
/// domain errors; only a genuine programmer error is internal.
impl From<CoreError> for RpcError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Internal(msg) => RpcError::new(INTERNAL_ERROR, msg),
            other => RpcError::invalid_params(other.to_string()),
        }
    }
}
