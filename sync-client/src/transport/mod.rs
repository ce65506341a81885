//! Transport abstraction for opsync.
//!
//! This module provides a pluggable transport layer that abstracts how the
//! client reaches the sync server (HTTP, in-memory mock for testing).
//!
//! # Design
//!
//! The transport trait is async and request/response oriented; every call
//! maps to one endpoint of the sync API:
//! - `upload()` sends a batch of operations
//! - `download()` fetches a page of operations after a sequence
//! - `status()`, `restore_points()`, `compact()`, `delete_all()` manage the
//!   account
//!
//! The account itself is bound to the transport instance.
//!
//! # Example
//!
//! ```ignore
//! let transport = HttpTransport::new("http://localhost:8080", UserId::new("alice"))?;
//! let response = transport.download(&DownloadRequest { since_seq, limit: None, exclude_client: None }).await?;
//! ```

mod http;
mod mock;

pub use http::HttpTransport;
pub use mock::MockTransport;

use async_trait::async_trait;
use opsync_types::{
    CompactResponse, DeleteAllResponse, DownloadRequest, DownloadResponse, RestorePointsResponse,
    StatusResponse, UploadRequest, UploadResponse,
};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failed or was aborted mid-request.
    #[error("network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("request timeout")]
    Timeout,

    /// Server answered with a non-success status.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Error message from the server.
        message: String,
    },

    /// The account is over its storage quota.
    #[error("storage quota exceeded ({used_bytes} of {quota_bytes} bytes)")]
    QuotaExceeded {
        /// Bytes in use.
        used_bytes: u64,
        /// Account quota.
        quota_bytes: u64,
    },

    /// Too many requests; wait for the next cycle.
    #[error("rate limited")]
    RateLimited,

    /// Response body could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// True for failures worth retrying within a cycle (network abort,
    /// timeout, 5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Server { status, .. } => *status >= 500,
            TransportError::QuotaExceeded { .. }
            | TransportError::RateLimited
            | TransportError::InvalidResponse(_) => false,
        }
    }
}

/// Transport trait for the sync protocol.
///
/// Implementations handle the underlying connection mechanism
/// (HTTP, in-process, mock).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Upload operations. Per-op outcomes are in the response.
    async fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError>;

    /// Download operations with `serverSeq > request.since_seq`.
    async fn download(&self, request: &DownloadRequest)
        -> Result<DownloadResponse, TransportError>;

    /// Account status.
    async fn status(&self) -> Result<StatusResponse, TransportError>;

    /// Restore points, newest first.
    async fn restore_points(&self, limit: u32) -> Result<RestorePointsResponse, TransportError>;

    /// Ask the server to compact history behind restore points.
    async fn compact(&self) -> Result<CompactResponse, TransportError>;

    /// Delete every operation stored for the account.
    async fn delete_all(&self) -> Result<DeleteAllResponse, TransportError>;
}
