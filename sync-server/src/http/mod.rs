//! HTTP endpoints for opsync-server.
//!
//! The sync API lives under `/api/sync`; `/health` and `/metrics` are for
//! operators.

mod api;
pub mod health;
mod metrics;

use crate::server::SyncServer;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use std::sync::Arc;

pub use api::{Account, USER_HEADER};
pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(server: Arc<SyncServer>) -> Router {
    let body_limit = server.config().server.max_request_bytes;

    Router::new()
        .route(
            "/api/sync/ops",
            post(api::upload_handler).get(api::download_handler),
        )
        .route("/api/sync/status", get(api::status_handler))
        .route("/api/sync/restore-points", get(api::restore_points_handler))
        .route("/api/sync/compact", post(api::compact_handler))
        .route("/api/sync/data", delete(api::delete_all_handler))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteStorage;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use opsync_types::{
        ClientId, DownloadResponse, EntityType, ErrorBody, OpType, Operation, StatusResponse,
        UploadRequest, UploadResponse, UploadStatus, VectorClock,
    };
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use tower::util::ServiceExt;

    async fn test_server_with(config: Config) -> Arc<SyncServer> {
        let storage = SqliteStorage::in_memory().await.unwrap();
        Arc::new(SyncServer::new(config, storage))
    }

    async fn test_server() -> Arc<SyncServer> {
        test_server_with(Config::default()).await
    }

    fn task_op(client: &ClientId, entity_id: &str) -> Operation {
        let mut clock = VectorClock::new();
        clock.increment(client);
        Operation::new(
            client.clone(),
            OpType::Create,
            EntityType::Task,
            Some(entity_id.to_string()),
            json!({"title": "Buy milk"}),
            clock,
            0,
        )
    }

    fn upload_body(client: &ClientId, ops: Vec<Operation>) -> Body {
        let request = UploadRequest {
            client_id: client.clone(),
            ops,
            last_known_server_seq: None,
            request_id: None,
        };
        Body::from(serde_json::to_vec(&request).unwrap())
    }

    fn post_ops(user: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/sync/ops")
            .header(USER_HEADER, user)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    fn get_as(user: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(USER_HEADER, user)
            .body(Body::empty())
            .unwrap()
    }

    async fn read_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = build_router(test_server().await);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let app = build_router(test_server().await);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("opsync_server_uploads_total 0"));
    }

    #[tokio::test]
    async fn missing_account_header_is_unauthorized() {
        let app = build_router(test_server().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sync/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error_code, "MISSING_USER");
    }

    #[tokio::test]
    async fn upload_then_download() {
        let server = test_server().await;
        let client = ClientId::new("phone");

        let response = build_router(Arc::clone(&server))
            .oneshot(post_ops("alice", upload_body(&client, vec![task_op(&client, "t1")])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let uploaded: UploadResponse = read_json(response).await;
        assert!(matches!(
            uploaded.results[0].status,
            UploadStatus::Accepted { .. }
        ));

        let response = build_router(Arc::clone(&server))
            .oneshot(get_as("alice", "/api/sync/ops?sinceSeq=0&excludeClient=laptop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page: DownloadResponse = read_json(response).await;
        assert_eq!(page.ops.len(), 1);
        assert_eq!(page.latest_seq.value(), 1);

        // Another account sees nothing.
        let response = build_router(Arc::clone(&server))
            .oneshot(get_as("bob", "/api/sync/ops?sinceSeq=0"))
            .await
            .unwrap();
        let page: DownloadResponse = read_json(response).await;
        assert!(page.ops.is_empty());

        assert_eq!(
            server
                .metrics()
                .ops_accepted
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn quota_exceeded_is_413_with_usage() {
        let mut config = Config::default();
        config.quota.default_quota_bytes = 1;
        let server = test_server_with(config).await;
        let client = ClientId::new("phone");

        let response = build_router(server)
            .oneshot(post_ops("alice", upload_body(&client, vec![task_op(&client, "t1")])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error_code, "STORAGE_QUOTA_EXCEEDED");
        assert_eq!(body.storage_quota_bytes, Some(1));
    }

    #[tokio::test]
    async fn upload_rate_limit_is_429() {
        let mut config = Config::default();
        config.limits.uploads_per_minute = 1;
        let server = test_server_with(config).await;
        let client = ClientId::new("phone");

        let first = build_router(Arc::clone(&server))
            .oneshot(post_ops("alice", upload_body(&client, vec![])))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = build_router(Arc::clone(&server))
            .oneshot(post_ops("alice", upload_body(&client, vec![])))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn status_and_maintenance_routes() {
        let server = test_server().await;

        let response = build_router(Arc::clone(&server))
            .oneshot(get_as("alice", "/api/sync/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: StatusResponse = read_json(response).await;
        assert_eq!(status.latest_seq.value(), 0);

        let response = build_router(Arc::clone(&server))
            .oneshot(get_as("alice", "/api/sync/restore-points?limit=5"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = build_router(Arc::clone(&server))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync/compact")
                    .header(USER_HEADER, "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = build_router(server)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/sync/data")
                    .header(USER_HEADER, "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
