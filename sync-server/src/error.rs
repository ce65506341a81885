//! Error types for opsync-server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use opsync_types::ErrorBody;
use std::path::PathBuf;

/// Main error type for opsync-server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },

    /// The account is over its storage quota.
    #[error("storage quota exceeded: {used_bytes} of {quota_bytes} bytes used")]
    QuotaExceeded {
        /// Recalculated usage.
        used_bytes: u64,
        /// Account quota.
        quota_bytes: u64,
    },

    /// The request is malformed or exceeds a request-level limit.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No account header on a request that needs one.
    #[error("missing account header")]
    MissingUser,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServerError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::MissingUser => StatusCode::UNAUTHORIZED,
            ServerError::Config(_) | ServerError::Storage(_) | ServerError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable code carried in the error body.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::RateLimited { .. } => "RATE_LIMITED",
            ServerError::QuotaExceeded { .. } => "STORAGE_QUOTA_EXCEEDED",
            ServerError::InvalidRequest(_) => "INVALID_REQUEST",
            ServerError::MissingUser => "MISSING_USER",
            ServerError::Config(_) | ServerError::Storage(_) | ServerError::Io(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    fn body(&self) -> ErrorBody {
        let (storage_used_bytes, storage_quota_bytes) = match self {
            ServerError::QuotaExceeded {
                used_bytes,
                quota_bytes,
            } => (Some(*used_bytes), Some(*quota_bytes)),
            _ => (None, None),
        };
        let error = match self {
            // Storage details stay in the server log.
            ServerError::Storage(_) | ServerError::Io(_) | ServerError::Config(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        ErrorBody {
            error,
            error_code: self.error_code().to_string(),
            storage_used_bytes,
            storage_quota_bytes,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(self.body())).into_response()
    }
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt operation row {op_id}: {reason}")]
    Corrupt {
        /// Operation id of the row.
        op_id: String,
        /// What failed to decode.
        reason: String,
    },

    /// No sync state exists for the account.
    #[error("unknown account: {user_id}")]
    UnknownAccount {
        /// The account id.
        user_id: String,
    },

    /// JSON encoding of a column failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_error_maps_to_413_with_usage() {
        let err = ServerError::QuotaExceeded {
            used_bytes: 120,
            quota_bytes: 100,
        };
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let body = err.body();
        assert_eq!(body.error_code, "STORAGE_QUOTA_EXCEEDED");
        assert_eq!(body.storage_used_bytes, Some(120));
        assert_eq!(body.storage_quota_bytes, Some(100));
    }

    #[test]
    fn rate_limit_maps_to_429() {
        let err = ServerError::RateLimited {
            reason: "upload rate limit exceeded".into(),
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error_code(), "RATE_LIMITED");
    }

    #[test]
    fn storage_error_hides_detail() {
        let err = ServerError::Storage(StorageError::Corrupt {
            op_id: "op-1".into(),
            reason: "bad clock".into(),
        });
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body().error, "internal server error");
        assert!(err.body().storage_used_bytes.is_none());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServerError>();
        assert_send_sync::<StorageError>();
    }
}
