//! Main SyncServer coordination.
//!
//! SyncServer owns the sync service, rate limiters, and operational
//! counters shared by the HTTP handlers and the cleanup task.

use crate::config::Config;
use crate::limits::RateLimits;
use crate::service::SyncService;
use crate::storage::SqliteStorage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Operational metrics for monitoring server activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Upload requests handled successfully.
    pub uploads_total: AtomicU64,
    /// Download requests handled successfully.
    pub downloads_total: AtomicU64,
    /// Operations stored under a fresh sequence.
    pub ops_accepted: AtomicU64,
    /// Operations that were already stored.
    pub ops_duplicate: AtomicU64,
    /// Operations refused by validation.
    pub ops_rejected: AtomicU64,
    /// Operations or uploads refused for quota.
    pub quota_rejections: AtomicU64,
    /// Requests refused by a rate limiter.
    pub rate_limit_hits: AtomicU64,
    /// Compactions that removed history.
    pub compactions_total: AtomicU64,
    /// Requests that failed with a server error.
    pub errors_total: AtomicU64,
}

impl ServerMetrics {
    /// Bump a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Main sync server.
pub struct SyncServer {
    config: Config,
    service: Arc<SyncService>,
    /// Per-account and global request limiters.
    rate_limits: RateLimits,
    metrics: ServerMetrics,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("service", &self.service)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl SyncServer {
    /// Create a new SyncServer with the given config and storage.
    pub fn new(config: Config, storage: SqliteStorage) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        let service = Arc::new(SyncService::new(&config, Arc::new(storage)));
        Self {
            config,
            service,
            rate_limits,
            metrics: ServerMetrics::default(),
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the sync service.
    pub fn service(&self) -> &SyncService {
        &self.service
    }

    /// Get a clone of the service Arc for background tasks.
    pub fn service_arc(&self) -> Arc<SyncService> {
        Arc::clone(&self.service)
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &SqliteStorage {
        self.service.storage()
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }
}
