//! Sync API handlers.
//!
//! Every route is scoped to the account named in the `X-Sync-User` header.
//! The global limiter runs first, then the per-account upload or download
//! budget.

use crate::error::ServerError;
use crate::limits::RateLimitError;
use crate::server::{ServerMetrics, SyncServer};
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::{Extension, Json};
use opsync_types::{
    CompactResponse, DeleteAllResponse, DownloadRequest, DownloadResponse, RestorePointsResponse,
    StatusResponse, UploadRequest, UploadResponse, UploadStatus, UserId,
};
use serde::Deserialize;
use std::sync::Arc;

/// Header carrying the account id.
pub const USER_HEADER: &str = "x-sync-user";

/// Longest accepted account id.
const MAX_USER_LEN: usize = 255;

/// The account a request acts on.
#[derive(Debug, Clone)]
pub struct Account(pub UserId);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Account {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ServerError::MissingUser)?;

        if value.len() > MAX_USER_LEN {
            return Err(ServerError::InvalidRequest(format!(
                "account id longer than {MAX_USER_LEN} characters"
            )));
        }
        Ok(Account(UserId::new(value)))
    }
}

/// Query for the restore point listing.
#[derive(Debug, Deserialize)]
pub struct RestorePointsQuery {
    /// Maximum entries to return.
    pub limit: Option<u32>,
}

fn rate_limited(server: &SyncServer, err: RateLimitError) -> ServerError {
    ServerMetrics::incr(&server.metrics().rate_limit_hits);
    err.into()
}

fn check_global(server: &SyncServer) -> Result<(), ServerError> {
    server
        .rate_limits()
        .check_global()
        .map_err(|e| rate_limited(server, e))
}

/// Count failures that reached the handler.
fn track<T>(server: &SyncServer, result: Result<T, ServerError>) -> Result<T, ServerError> {
    if let Err(err) = &result {
        match err {
            ServerError::QuotaExceeded { .. } => {
                ServerMetrics::incr(&server.metrics().quota_rejections)
            }
            err if err.status_code().is_server_error() => {
                ServerMetrics::incr(&server.metrics().errors_total)
            }
            _ => {}
        }
    }
    result
}

/// `POST /api/sync/ops`
pub async fn upload_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Account(user_id): Account,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ServerError> {
    check_global(&server)?;
    server
        .rate_limits()
        .check_upload(&user_id)
        .map_err(|e| rate_limited(&server, e))?;

    let response = track(&server, server.service().upload(&user_id, &request).await)?;

    let metrics = server.metrics();
    ServerMetrics::incr(&metrics.uploads_total);
    if !response.deduplicated {
        for result in &response.results {
            let counter = match result.status {
                UploadStatus::Accepted { .. } => &metrics.ops_accepted,
                UploadStatus::Duplicate => &metrics.ops_duplicate,
                UploadStatus::Rejected { .. } => &metrics.ops_rejected,
                UploadStatus::QuotaExceeded { .. } => &metrics.quota_rejections,
            };
            ServerMetrics::incr(counter);
        }
    }

    Ok(Json(response))
}

/// `GET /api/sync/ops?sinceSeq=&limit=&excludeClient=`
pub async fn download_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Account(user_id): Account,
    Query(request): Query<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ServerError> {
    check_global(&server)?;
    server
        .rate_limits()
        .check_download(&user_id)
        .map_err(|e| rate_limited(&server, e))?;

    let response = track(
        &server,
        server
            .service()
            .fetch(&user_id, &request)
            .await
            .map_err(ServerError::from),
    )?;
    ServerMetrics::incr(&server.metrics().downloads_total);

    Ok(Json(response))
}

/// `GET /api/sync/status`
pub async fn status_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Account(user_id): Account,
) -> Result<Json<StatusResponse>, ServerError> {
    check_global(&server)?;
    let status = server.service().status(&user_id).await.map_err(ServerError::from);
    track(&server, status).map(Json)
}

/// `GET /api/sync/restore-points?limit=`
pub async fn restore_points_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Account(user_id): Account,
    Query(query): Query<RestorePointsQuery>,
) -> Result<Json<RestorePointsResponse>, ServerError> {
    check_global(&server)?;
    let points = server
        .service()
        .restore_points(&user_id, query.limit)
        .await
        .map_err(ServerError::from);
    track(&server, points).map(Json)
}

/// `POST /api/sync/compact`
pub async fn compact_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Account(user_id): Account,
) -> Result<Json<CompactResponse>, ServerError> {
    check_global(&server)?;
    server
        .rate_limits()
        .check_upload(&user_id)
        .map_err(|e| rate_limited(&server, e))?;

    let result = server.service().compact(&user_id).await.map_err(ServerError::from);
    let result = track(&server, result)?;
    if result.success {
        ServerMetrics::incr(&server.metrics().compactions_total);
    }
    Ok(Json(result))
}

/// `DELETE /api/sync/data`
pub async fn delete_all_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Account(user_id): Account,
) -> Result<Json<DeleteAllResponse>, ServerError> {
    check_global(&server)?;
    server
        .rate_limits()
        .check_upload(&user_id)
        .map_err(|e| rate_limited(&server, e))?;

    let deleted = server.service().delete_all(&user_id).await.map_err(ServerError::from);
    track(&server, deleted).map(Json)
}
