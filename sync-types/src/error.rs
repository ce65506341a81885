//! Error types for opsync wire types.

use thiserror::Error;

/// Errors produced while parsing wire types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Unknown operation kind
    #[error("unknown op type: {0}")]
    UnknownOpType(String),

    /// Unknown entity kind
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// JSON (de)serialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
