//! Background cleanup task.
//!
//! Runs periodically to expire tombstones, forget stale devices, evict old
//! upload replies, and shrink the rate limiter and lock maps.

use crate::config::CleanupConfig;
use crate::limits::RateLimits;
use crate::service::{now_ms, SyncService};
use crate::storage::OpStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Tombstones deleted.
    pub tombstones: u64,
    /// Device records deleted.
    pub devices: u64,
    /// Cached upload replies evicted.
    pub requests: usize,
}

/// Run one cleanup pass at time `now`.
pub async fn run_cleanup(
    service: &SyncService,
    config: &CleanupConfig,
    now: i64,
) -> Result<CleanupStats, crate::error::StorageError> {
    let storage = service.storage();
    let tombstones = storage.cleanup_tombstones(now).await?;
    let devices = storage
        .cleanup_stale_devices(now.saturating_sub(config.stale_device_ms()))
        .await?;
    let requests = service.evict_expired_requests();
    service.shrink_locks();

    Ok(CleanupStats {
        tombstones,
        devices,
        requests,
    })
}

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    service: Arc<SyncService>,
    rate_limits: RateLimits,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs;
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            match run_cleanup(&service, &config, now_ms()).await {
                Ok(stats) if stats != CleanupStats::default() => {
                    tracing::info!(
                        "Cleanup: {} tombstones, {} stale devices, {} cached replies",
                        stats.tombstones,
                        stats.devices,
                        stats.requests
                    );
                }
                Ok(_) => tracing::debug!("Cleanup: nothing to do"),
                Err(e) => tracing::error!("Cleanup error: {}", e),
            }

            rate_limits.shrink();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LimitsConfig};
    use crate::storage::SqliteStorage;
    use opsync_types::{ClientId, EntityType, OpType, Operation, UserId, VectorClock};
    use serde_json::json;

    async fn test_service(config: &Config) -> SyncService {
        let storage = SqliteStorage::in_memory().await.unwrap();
        SyncService::new(config, Arc::new(storage))
    }

    fn delete_op(client: &ClientId, entity_id: &str) -> Operation {
        let mut clock = VectorClock::new();
        clock.increment(client);
        Operation::new(
            client.clone(),
            OpType::Delete,
            EntityType::Task,
            Some(entity_id.to_string()),
            json!({}),
            clock,
            now_ms(),
        )
    }

    #[tokio::test]
    async fn expired_tombstones_and_stale_devices_removed() {
        let config = Config::default();
        let service = test_service(&config).await;
        let user = UserId::new("alice");
        let client = ClientId::new("a");
        service
            .ingest(&user, &client, &[delete_op(&client, "t1")])
            .await
            .unwrap();

        // Far enough ahead that both the tombstone and device have aged out.
        let later = now_ms()
            + config.cleanup.tombstone_retention_ms()
            + config.cleanup.stale_device_ms()
            + 1;
        let stats = run_cleanup(&service, &config.cleanup, later).await.unwrap();
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.devices, 1);

        assert!(service
            .storage()
            .get_tombstone(&user, EntityType::Task, "t1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn fresh_records_survive() {
        let config = Config::default();
        let service = test_service(&config).await;
        let user = UserId::new("alice");
        let client = ClientId::new("a");
        service
            .ingest(&user, &client, &[delete_op(&client, "t1")])
            .await
            .unwrap();

        let stats = run_cleanup(&service, &config.cleanup, now_ms()).await.unwrap();
        assert_eq!(stats.devices, 0);
        assert_eq!(stats.tombstones, 0);
    }

    #[tokio::test]
    async fn cleanup_task_disabled() {
        let mut config = Config::default();
        config.cleanup.enabled = false;
        let service = Arc::new(test_service(&config).await);

        let handle = spawn_cleanup_task(
            service,
            RateLimits::new(&LimitsConfig::default()),
            config.cleanup,
        );

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }
}
