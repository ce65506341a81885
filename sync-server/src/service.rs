//! The sync service: ingest, fetch, and account maintenance.
//!
//! Writes for one account (ingest, compaction, delete-all) are serialized
//! by a per-account async lock; different accounts never contend. Within
//! the lock every operation is committed in its own transaction, so a
//! rejection mid-batch leaves earlier acceptances in place.

use crate::config::Config;
use crate::error::{ServerError, StorageError};
use crate::quota;
use crate::storage::{InsertOutcome, NewOperation, OpStorage, SqliteStorage};
use crate::validation::{validate_operation, ValidationLimits};
use dashmap::DashMap;
use opsync_types::{
    ClientId, CompactResponse, DeleteAllResponse, DownloadRequest, DownloadResponse, Operation,
    RestorePointsResponse, ServerSeq, StatusResponse, UploadRequest, UploadResponse, UploadResult,
    UploadStatus, UserId, DEFAULT_DOWNLOAD_LIMIT, MAX_DOWNLOAD_LIMIT, PIGGYBACK_LIMIT,
};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default number of restore points listed.
pub const DEFAULT_RESTORE_POINT_LIMIT: u32 = 30;

/// Largest restore point listing.
pub const MAX_RESTORE_POINT_LIMIT: u32 = 100;

/// Upper bound on cached upload replies across all accounts.
const MAX_DEDUP_ENTRIES: usize = 10_000;

/// Current server time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct CachedUpload {
    stored_at: Instant,
    results: Vec<UploadResult>,
}

/// Server-side sync logic over an [`OpStorage`] backend.
pub struct SyncService {
    storage: Arc<SqliteStorage>,
    limits: ValidationLimits,
    default_quota_bytes: u64,
    max_ops_per_upload: usize,
    tombstone_retention_ms: i64,
    online_window_ms: i64,
    dedup_ttl: Duration,
    account_locks: DashMap<UserId, Arc<Mutex<()>>>,
    dedup: DashMap<(UserId, String), CachedUpload>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("limits", &self.limits)
            .field("default_quota_bytes", &self.default_quota_bytes)
            .field("accounts_locked", &self.account_locks.len())
            .field("dedup_entries", &self.dedup.len())
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Create a service over `storage` with limits from `config`.
    pub fn new(config: &Config, storage: Arc<SqliteStorage>) -> Self {
        Self {
            storage,
            limits: ValidationLimits::from(config),
            default_quota_bytes: config.quota.default_quota_bytes,
            max_ops_per_upload: config.limits.max_ops_per_upload,
            tombstone_retention_ms: config.cleanup.tombstone_retention_ms(),
            online_window_ms: i64::try_from(config.server.online_window_secs.saturating_mul(1000))
                .unwrap_or(i64::MAX),
            dedup_ttl: Duration::from_secs(config.server.dedup_ttl_secs),
            account_locks: DashMap::new(),
            dedup: DashMap::new(),
        }
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    fn account_lock(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        self.account_locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Store a batch of operations for an account.
    ///
    /// Per operation: duplicate check, validation, quota check, then a
    /// transactional insert that assigns the next sequence. Returns one
    /// result per op in request order.
    pub async fn ingest(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        ops: &[Operation],
    ) -> Result<Vec<UploadResult>, StorageError> {
        let lock = self.account_lock(user_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        self.storage
            .ensure_user(user_id, self.default_quota_bytes)
            .await?;
        self.storage.touch_device(user_id, client_id, now).await?;

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let status = self.ingest_one(user_id, op, now).await?;
            results.push(UploadResult {
                op_id: op.id.clone(),
                status,
            });
        }

        let accepted = results
            .iter()
            .filter(|r| matches!(r.status, UploadStatus::Accepted { .. }))
            .count();
        debug!(
            "Ingested {} ops for {} from {}: {} accepted",
            ops.len(),
            user_id,
            client_id,
            accepted
        );
        Ok(results)
    }

    async fn ingest_one(
        &self,
        user_id: &UserId,
        op: &Operation,
        now: i64,
    ) -> Result<UploadStatus, StorageError> {
        if self.storage.op_exists(user_id, &op.id).await? {
            debug!("Duplicate op {} for {}", op.id, user_id);
            return Ok(UploadStatus::Duplicate);
        }

        if let Err(rejection) = validate_operation(op, &self.limits, now) {
            warn!(
                "Rejected op {} for {} ({} {}): {:?} {}",
                op.id, user_id, op.op_type, op.entity_type, rejection.code, rejection.message
            );
            return Ok(UploadStatus::Rejected {
                code: rejection.code,
                message: rejection.message,
            });
        }

        let check = quota::check_quota(
            self.storage.as_ref(),
            user_id,
            op.payload_size() as u64,
            self.default_quota_bytes,
        )
        .await?;
        if !check.allowed {
            warn!(
                "Quota exceeded for {}: {} of {} bytes",
                user_id, check.used_bytes, check.quota_bytes
            );
            return Ok(UploadStatus::QuotaExceeded {
                used_bytes: check.used_bytes,
                quota_bytes: check.quota_bytes,
            });
        }

        let outcome = self
            .storage
            .insert_operation(NewOperation {
                user_id,
                op,
                received_at: now,
                tombstone_expires_at: now.saturating_add(self.tombstone_retention_ms),
            })
            .await?;

        Ok(match outcome {
            InsertOutcome::Inserted(server_seq) => UploadStatus::Accepted { server_seq },
            InsertOutcome::Duplicate => UploadStatus::Duplicate,
        })
    }

    /// Handle an upload request: dedup replay, ingest, piggybacked download.
    ///
    /// A batch in which every operation hit the quota fails as a whole with
    /// [`ServerError::QuotaExceeded`].
    pub async fn upload(
        &self,
        user_id: &UserId,
        request: &UploadRequest,
    ) -> Result<UploadResponse, ServerError> {
        if request.ops.len() > self.max_ops_per_upload {
            return Err(ServerError::InvalidRequest(format!(
                "too many operations: {} (max {})",
                request.ops.len(),
                self.max_ops_per_upload
            )));
        }

        let (results, deduplicated) = match self.cached_results(user_id, request) {
            Some(results) => {
                debug!("Replaying cached upload for {}", user_id);
                (results, true)
            }
            None => {
                let results = self
                    .ingest(user_id, &request.client_id, &request.ops)
                    .await?;

                if let Some(UploadStatus::QuotaExceeded {
                    used_bytes,
                    quota_bytes,
                }) = all_quota_exceeded(&results)
                {
                    return Err(ServerError::QuotaExceeded {
                        used_bytes,
                        quota_bytes,
                    });
                }

                self.cache_results(user_id, request, &results);
                (results, false)
            }
        };

        let latest_seq = self.latest_seq(user_id).await?;

        // Recomputed on replay so a retry still sees fresh ops.
        let new_ops = match request.last_known_server_seq {
            Some(since) => {
                self.storage
                    .ops_after(
                        user_id,
                        since,
                        latest_seq,
                        PIGGYBACK_LIMIT,
                        Some(&request.client_id),
                    )
                    .await?
            }
            None => Vec::new(),
        };

        Ok(UploadResponse {
            results,
            latest_seq,
            new_ops,
            deduplicated,
        })
    }

    fn cached_results(
        &self,
        user_id: &UserId,
        request: &UploadRequest,
    ) -> Option<Vec<UploadResult>> {
        let request_id = request.request_id.as_ref()?;
        let key = (user_id.clone(), request_id.clone());
        let entry = self.dedup.get(&key)?;
        if entry.stored_at.elapsed() > self.dedup_ttl {
            drop(entry);
            self.dedup.remove(&key);
            return None;
        }
        Some(entry.results.clone())
    }

    fn cache_results(&self, user_id: &UserId, request: &UploadRequest, results: &[UploadResult]) {
        let Some(request_id) = request.request_id.as_ref() else {
            return;
        };

        if self.dedup.len() >= MAX_DEDUP_ENTRIES {
            self.evict_expired_requests();
        }
        if self.dedup.len() >= MAX_DEDUP_ENTRIES {
            let oldest = self
                .dedup
                .iter()
                .min_by_key(|entry| entry.stored_at)
                .map(|entry| entry.key().clone());
            if let Some(key) = oldest {
                self.dedup.remove(&key);
            }
        }

        self.dedup.insert(
            (user_id.clone(), request_id.clone()),
            CachedUpload {
                stored_at: Instant::now(),
                results: results.to_vec(),
            },
        );
    }

    /// Drop cached upload replies older than the dedup window.
    ///
    /// Returns the number of entries removed.
    pub fn evict_expired_requests(&self) -> usize {
        let before = self.dedup.len();
        let ttl = self.dedup_ttl;
        self.dedup.retain(|_, entry| entry.stored_at.elapsed() <= ttl);
        before.saturating_sub(self.dedup.len())
    }

    /// Forget per-account locks nobody holds.
    pub fn shrink_locks(&self) {
        self.account_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    // =========================================================================
    // Fetch
    // =========================================================================

    async fn latest_seq(&self, user_id: &UserId) -> Result<ServerSeq, StorageError> {
        Ok(self
            .storage
            .user_state(user_id)
            .await?
            .map(|state| state.last_seq)
            .unwrap_or_default())
    }

    /// Operations newer than `since_seq`, ascending, one page at a time.
    ///
    /// `latestSeq` is read first and bounds the page, so ops committed
    /// while the page is read show up in the next call. `gapDetected` is
    /// computed on retained history regardless of `excludeClient`.
    pub async fn fetch(
        &self,
        user_id: &UserId,
        request: &DownloadRequest,
    ) -> Result<DownloadResponse, StorageError> {
        let since = request.since_seq;
        let limit = request
            .limit
            .unwrap_or(DEFAULT_DOWNLOAD_LIMIT)
            .clamp(1, MAX_DOWNLOAD_LIMIT);

        let latest_seq = self.latest_seq(user_id).await?;
        let min_seq = self.storage.min_seq(user_id).await?;
        let gap_detected = detect_gap(since, latest_seq, min_seq);

        let mut ops = self
            .storage
            .ops_after(
                user_id,
                since,
                latest_seq,
                limit + 1,
                request.exclude_client.as_ref(),
            )
            .await?;
        let has_more = ops.len() > limit as usize;
        ops.truncate(limit as usize);

        if gap_detected {
            info!(
                "Gap detected for {}: since={} latest={} min={:?}",
                user_id, since, latest_seq, min_seq
            );
        } else if let Some(client_id) = &request.exclude_client {
            let delivered = if has_more {
                ops.last().map(|op| op.server_seq).unwrap_or(since)
            } else {
                latest_seq
            };
            self.storage
                .ack_device(user_id, client_id, delivered, now_ms())
                .await?;
        }

        Ok(DownloadResponse {
            ops,
            has_more,
            latest_seq,
            gap_detected,
        })
    }

    // =========================================================================
    // Account maintenance
    // =========================================================================

    /// Sequence, usage, and online device count for an account.
    pub async fn status(&self, user_id: &UserId) -> Result<StatusResponse, StorageError> {
        let state = self
            .storage
            .ensure_user(user_id, self.default_quota_bytes)
            .await?;
        let devices_online = self
            .storage
            .devices_online(user_id, now_ms().saturating_sub(self.online_window_ms))
            .await?;

        Ok(StatusResponse {
            latest_seq: state.last_seq,
            devices_online,
            storage_used_bytes: state.storage_used_bytes,
            storage_quota_bytes: state.storage_quota_bytes,
        })
    }

    /// Retained restore points, newest first.
    ///
    /// `limit` defaults to 30 and is clamped to 1..=100.
    pub async fn restore_points(
        &self,
        user_id: &UserId,
        limit: Option<u32>,
    ) -> Result<RestorePointsResponse, StorageError> {
        let limit = limit
            .unwrap_or(DEFAULT_RESTORE_POINT_LIMIT)
            .clamp(1, MAX_RESTORE_POINT_LIMIT);
        let restore_points = self.storage.list_restore_points(user_id, limit).await?;
        Ok(RestorePointsResponse { restore_points })
    }

    /// Compact the account's history behind its restore points.
    pub async fn compact(&self, user_id: &UserId) -> Result<CompactResponse, StorageError> {
        let lock = self.account_lock(user_id);
        let _guard = lock.lock().await;
        quota::compact(self.storage.as_ref(), user_id, now_ms()).await
    }

    /// Delete every operation of the account.
    ///
    /// First step of a password rotation. Sequence numbers keep counting
    /// from where they were.
    pub async fn delete_all(&self, user_id: &UserId) -> Result<DeleteAllResponse, StorageError> {
        let lock = self.account_lock(user_id);
        let _guard = lock.lock().await;

        let stats = self.storage.delete_all(user_id).await?;
        self.dedup.retain(|(user, _), _| user != user_id);
        info!(
            "Deleted all data for {}: {} ops, {} bytes",
            user_id, stats.deleted_count, stats.freed_bytes
        );

        Ok(DeleteAllResponse {
            deleted_count: stats.deleted_count,
        })
    }

    /// Change an account's quota.
    pub async fn set_quota(&self, user_id: &UserId, quota_bytes: u64) -> Result<(), StorageError> {
        self.storage.set_quota(user_id, quota_bytes).await
    }
}

/// The client's cursor does not line up with retained history.
///
/// Only a cursor past zero can have a gap: the server is behind it, or the
/// ops right after it were compacted or deleted.
fn detect_gap(since: ServerSeq, latest: ServerSeq, min: Option<ServerSeq>) -> bool {
    let since = since.value();
    if since == 0 {
        return false;
    }
    if since > latest.value() {
        return true;
    }
    match min {
        Some(min) => since < min.value().saturating_sub(1),
        None => since < latest.value(),
    }
}

fn all_quota_exceeded(results: &[UploadResult]) -> Option<UploadStatus> {
    if results.is_empty() {
        return None;
    }
    let mut last = None;
    for result in results {
        match &result.status {
            status @ UploadStatus::QuotaExceeded { .. } => last = Some(status.clone()),
            _ => return None,
        }
    }
    last
}
