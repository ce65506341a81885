//! HTTP transport over reqwest.
//!
//! JSON bodies, account in the `X-Sync-User` header. Quota and rate-limit
//! statuses map to their own error variants so the retry policy can tell
//! them apart from server faults.

use super::{Transport, TransportError};
use async_trait::async_trait;
use opsync_types::{
    CompactResponse, DeleteAllResponse, DownloadRequest, DownloadResponse, ErrorBody,
    RestorePointsResponse, StatusResponse, UploadRequest, UploadResponse, UserId,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Header carrying the account id.
pub const USER_HEADER: &str = "X-Sync-User";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP transport bound to one account.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    user_id: UserId,
    client: Client,
}

impl HttpTransport {
    /// Create a transport for `user_id` against `base_url`.
    pub fn new(base_url: impl Into<String>, user_id: UserId) -> Result<Self, TransportError> {
        Self::with_timeout(base_url, user_id, DEFAULT_TIMEOUT)
    }

    /// Create a transport with an explicit request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        user_id: UserId,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id,
            client,
        })
    }

    /// Base URL of the server.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<R, TransportError> {
        let response = request
            .header(USER_HEADER, self.user_id.as_str())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|e| TransportError::InvalidResponse(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "sync request failed");
        Err(error_from_status(status, &body))
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(error.to_string())
    }
}

fn error_from_status(status: StatusCode, body: &str) -> TransportError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();

    match status {
        StatusCode::PAYLOAD_TOO_LARGE => match parsed {
            Some(ErrorBody {
                storage_used_bytes: Some(used_bytes),
                storage_quota_bytes: Some(quota_bytes),
                ..
            }) => TransportError::QuotaExceeded {
                used_bytes,
                quota_bytes,
            },
            other => TransportError::Server {
                status: status.as_u16(),
                message: other.map(|b| b.error).unwrap_or_else(|| body.to_string()),
            },
        },
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited,
        _ => TransportError::Server {
            status: status.as_u16(),
            message: parsed.map(|b| b.error).unwrap_or_else(|| body.to_string()),
        },
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError> {
        self.send(self.client.post(self.url("/api/sync/ops")).json(request))
            .await
    }

    async fn download(
        &self,
        request: &DownloadRequest,
    ) -> Result<DownloadResponse, TransportError> {
        let mut query = vec![("sinceSeq", request.since_seq.value().to_string())];
        if let Some(limit) = request.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(client) = &request.exclude_client {
            query.push(("excludeClient", client.as_str().to_string()));
        }
        self.send(self.client.get(self.url("/api/sync/ops")).query(&query))
            .await
    }

    async fn status(&self) -> Result<StatusResponse, TransportError> {
        self.send(self.client.get(self.url("/api/sync/status"))).await
    }

    async fn restore_points(&self, limit: u32) -> Result<RestorePointsResponse, TransportError> {
        self.send(
            self.client
                .get(self.url("/api/sync/restore-points"))
                .query(&[("limit", limit)]),
        )
        .await
    }

    async fn compact(&self) -> Result<CompactResponse, TransportError> {
        self.send(self.client.post(self.url("/api/sync/compact"))).await
    }

    async fn delete_all(&self) -> Result<DeleteAllResponse, TransportError> {
        self.send(self.client.delete(self.url("/api/sync/data"))).await
    }
}
