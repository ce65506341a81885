//! Prometheus metrics endpoint.

use crate::server::SyncServer;
use crate::storage::OpStorage;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(server): Extension<Arc<SyncServer>>) -> impl IntoResponse {
    let m = server.metrics();

    let uploads = m.uploads_total.load(Ordering::Relaxed);
    let downloads = m.downloads_total.load(Ordering::Relaxed);
    let accepted = m.ops_accepted.load(Ordering::Relaxed);
    let duplicate = m.ops_duplicate.load(Ordering::Relaxed);
    let rejected = m.ops_rejected.load(Ordering::Relaxed);
    let quota = m.quota_rejections.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let compactions = m.compactions_total.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    // Storage stats (best effort)
    let storage = server.storage();
    let stored_ops = storage.total_operations().await.unwrap_or(0);
    let storage_bytes = storage.total_storage_bytes().await.unwrap_or(0);
    let accounts = storage.total_accounts().await.unwrap_or(0);

    let limiter_keys = server.rate_limits().upload_keys_count()
        + server.rate_limits().download_keys_count();

    let body = format!(
        r#"# HELP opsync_server_info Server information
# TYPE opsync_server_info gauge
opsync_server_info{{version="{version}"}} 1

# HELP opsync_server_uploads_total Upload requests handled
# TYPE opsync_server_uploads_total counter
opsync_server_uploads_total {uploads}

# HELP opsync_server_downloads_total Download requests handled
# TYPE opsync_server_downloads_total counter
opsync_server_downloads_total {downloads}

# HELP opsync_server_ops_total Uploaded operations by outcome
# TYPE opsync_server_ops_total counter
opsync_server_ops_total{{outcome="accepted"}} {accepted}
opsync_server_ops_total{{outcome="duplicate"}} {duplicate}
opsync_server_ops_total{{outcome="rejected"}} {rejected}

# HELP opsync_server_quota_rejections_total Operations or uploads refused for quota
# TYPE opsync_server_quota_rejections_total counter
opsync_server_quota_rejections_total {quota}

# HELP opsync_server_rate_limit_hits_total Total rate limit rejections
# TYPE opsync_server_rate_limit_hits_total counter
opsync_server_rate_limit_hits_total {rate_limits}

# HELP opsync_server_compactions_total Compactions that removed history
# TYPE opsync_server_compactions_total counter
opsync_server_compactions_total {compactions}

# HELP opsync_server_errors_total Requests failed with a server error
# TYPE opsync_server_errors_total counter
opsync_server_errors_total {errors}

# HELP opsync_server_storage_ops Operations currently stored
# TYPE opsync_server_storage_ops gauge
opsync_server_storage_ops {stored_ops}

# HELP opsync_server_storage_bytes Payload bytes currently stored
# TYPE opsync_server_storage_bytes gauge
opsync_server_storage_bytes {storage_bytes}

# HELP opsync_server_accounts Accounts with sync state
# TYPE opsync_server_accounts gauge
opsync_server_accounts {accounts}

# HELP opsync_server_rate_limiter_keys Accounts tracked by rate limiters
# TYPE opsync_server_rate_limiter_keys gauge
opsync_server_rate_limiter_keys {limiter_keys}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
