//! Storage quota enforcement and history compaction.
//!
//! Usage is tracked as a cached counter on the account's sync state. The
//! counter only drifts upward (compaction and deletes refresh it), so it is
//! trusted when it says "under quota" and recalculated before refusing.
//!
//! Compaction collapses history behind restore points:
//!
//! ```text
//! seq:   1   2  [3]  4   5  [6]  7        [n] = restore point
//!        └──deleted──┘   └──kept──────┘
//! ```
//!
//! With two or more restore points everything through the older of the two
//! oldest goes. With one, everything strictly before it goes. A lone
//! restore point that is already the earliest retained op is never deleted.

use crate::error::StorageError;
use crate::storage::{DeleteStats, OpStorage};
use opsync_types::{CompactResponse, ServerSeq, UserId};
use tracing::{debug, info};

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    /// The incoming bytes fit.
    pub allowed: bool,
    /// Usage the decision was based on.
    pub used_bytes: u64,
    /// Account quota.
    pub quota_bytes: u64,
}

/// Decide whether `incoming_bytes` more fit under the account's quota.
///
/// Only refuses after recalculating usage from the operations table and
/// writing the fresh value back to the cache.
pub async fn check_quota<S: OpStorage + ?Sized>(
    storage: &S,
    user_id: &UserId,
    incoming_bytes: u64,
    default_quota_bytes: u64,
) -> Result<QuotaCheck, StorageError> {
    let state = storage.ensure_user(user_id, default_quota_bytes).await?;
    let quota_bytes = state.storage_quota_bytes;

    if state.storage_used_bytes.saturating_add(incoming_bytes) <= quota_bytes {
        return Ok(QuotaCheck {
            allowed: true,
            used_bytes: state.storage_used_bytes,
            quota_bytes,
        });
    }

    let used_bytes = storage.refresh_usage(user_id).await?;
    debug!(
        "Quota recheck for {}: cached={} actual={} incoming={} quota={}",
        user_id, state.storage_used_bytes, used_bytes, incoming_bytes, quota_bytes
    );

    Ok(QuotaCheck {
        allowed: used_bytes.saturating_add(incoming_bytes) <= quota_bytes,
        used_bytes,
        quota_bytes,
    })
}

/// Delete history made redundant by restore points.
///
/// Callers hold the account's ingest lock.
pub async fn compact<S: OpStorage + ?Sized>(
    storage: &S,
    user_id: &UserId,
    now: i64,
) -> Result<CompactResponse, StorageError> {
    let restore_points = storage.oldest_restore_points(user_id, 2).await?;

    let cutoff = match (restore_points.first(), restore_points.get(1)) {
        (None, _) => {
            debug!("Compaction for {}: no restore points", user_id);
            return Ok(failed());
        }
        (Some(older), Some(_newer)) => older.server_seq,
        (Some(only), None) => {
            let earliest = storage.min_seq(user_id).await?;
            if earliest.map_or(true, |min| min >= only.server_seq) {
                debug!(
                    "Compaction for {}: lone restore point at {} is the earliest op",
                    user_id, only.server_seq
                );
                return Ok(failed());
            }
            ServerSeq::new(only.server_seq.value() - 1)
        }
    };

    let DeleteStats {
        deleted_count,
        freed_bytes,
    } = storage.delete_ops_through(user_id, cutoff).await?;
    storage.refresh_usage(user_id).await?;

    if deleted_count == 0 {
        return Ok(failed());
    }

    storage.mark_compacted(user_id, now).await?;
    info!(
        "Compacted {}: deleted {} ops through seq {} ({} bytes)",
        user_id, deleted_count, cutoff, freed_bytes
    );

    Ok(CompactResponse {
        success: true,
        deleted_count,
        freed_bytes,
    })
}

fn failed() -> CompactResponse {
    CompactResponse {
        success: false,
        deleted_count: 0,
        freed_bytes: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InsertOutcome, NewOperation, SqliteStorage};
    use opsync_types::{ClientId, EntityType, OpType, Operation, VectorClock};
    use serde_json::json;

    const QUOTA: u64 = 1024 * 1024;

    fn make_op(op_type: OpType) -> Operation {
        let client = ClientId::new("client-a");
        let mut clock = VectorClock::new();
        clock.increment(&client);
        let (entity_type, entity_id) = if op_type.is_restore_point() {
            (EntityType::All, None)
        } else {
            (EntityType::Task, Some("t1".to_string()))
        };
        Operation::new(
            client,
            op_type,
            entity_type,
            entity_id,
            json!({"title": "x"}),
            clock,
            0,
        )
    }

    /// Store one op per entry; `true` marks a restore point.
    async fn seeded(kinds: &[bool]) -> (SqliteStorage, UserId) {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let user_id = UserId::new("alice");
        storage.ensure_user(&user_id, QUOTA).await.unwrap();
        for &restore in kinds {
            let op = make_op(if restore { OpType::SyncImport } else { OpType::Create });
            let outcome = storage
                .insert_operation(NewOperation {
                    user_id: &user_id,
                    op: &op,
                    received_at: 0,
                    tombstone_expires_at: 0,
                })
                .await
                .unwrap();
            assert!(matches!(outcome, InsertOutcome::Inserted(_)));
        }
        (storage, user_id)
    }

    async fn retained(storage: &SqliteStorage, user_id: &UserId) -> Vec<u64> {
        storage
            .ops_after(user_id, ServerSeq::zero(), ServerSeq::new(u64::MAX >> 1), 1000, None)
            .await
            .unwrap()
            .iter()
            .map(|op| op.server_seq.value())
            .collect()
    }

    // ===========================================
    // Compaction
    // ===========================================

    #[tokio::test]
    async fn two_restore_points_delete_through_older() {
        // Restore points at 3 and 6, ordinary ops at 1, 2, 4, 5, 7.
        let (storage, user_id) = seeded(&[false, false, true, false, false, true, false]).await;
        let per_op = make_op(OpType::Create).payload_size() as u64;

        let result = compact(&storage, &user_id, 42).await.unwrap();
        assert!(result.success);
        assert_eq!(result.deleted_count, 3);
        assert_eq!(result.freed_bytes, 3 * per_op);
        assert_eq!(retained(&storage, &user_id).await, vec![4, 5, 6, 7]);

        let state = storage.user_state(&user_id).await.unwrap().unwrap();
        assert_eq!(state.storage_used_bytes, 4 * per_op);
        assert_eq!(state.last_compacted_at, Some(42));
    }

    #[tokio::test]
    async fn lone_restore_point_at_start_fails() {
        let (storage, user_id) = seeded(&[true, false, false]).await;

        let result = compact(&storage, &user_id, 42).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.deleted_count, 0);
        assert_eq!(result.freed_bytes, 0);
        assert_eq!(retained(&storage, &user_id).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn lone_restore_point_drops_earlier_ops() {
        let (storage, user_id) = seeded(&[false, false, true, false]).await;

        let result = compact(&storage, &user_id, 42).await.unwrap();
        assert!(result.success);
        assert_eq!(result.deleted_count, 2);
        assert_eq!(retained(&storage, &user_id).await, vec![3, 4]);

        // Second run: the restore point is now the earliest op.
        let again = compact(&storage, &user_id, 43).await.unwrap();
        assert!(!again.success);
        assert_eq!(retained(&storage, &user_id).await, vec![3, 4]);
    }

    #[tokio::test]
    async fn no_restore_points_fails() {
        let (storage, user_id) = seeded(&[false, false]).await;

        let result = compact(&storage, &user_id, 42).await.unwrap();
        assert!(!result.success);
        assert_eq!(retained(&storage, &user_id).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn a_restore_point_always_survives() {
        let (storage, user_id) = seeded(&[true, true, true]).await;

        compact(&storage, &user_id, 1).await.unwrap();
        compact(&storage, &user_id, 2).await.unwrap();
        compact(&storage, &user_id, 3).await.unwrap();

        let points = storage.list_restore_points(&user_id, 10).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].server_seq, ServerSeq::new(3));
    }

    // ===========================================
    // Quota
    // ===========================================

    #[tokio::test]
    async fn check_quota_allows_within_limit() {
        let (storage, user_id) = seeded(&[]).await;
        let check = check_quota(&storage, &user_id, 100, QUOTA).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.used_bytes, 0);
        assert_eq!(check.quota_bytes, QUOTA);
    }

    #[tokio::test]
    async fn check_quota_refuses_over_limit() {
        let (storage, user_id) = seeded(&[false]).await;
        let per_op = make_op(OpType::Create).payload_size() as u64;
        storage.set_quota(&user_id, per_op + 5).await.unwrap();

        let check = check_quota(&storage, &user_id, 10, QUOTA).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.used_bytes, per_op);
        assert_eq!(check.quota_bytes, per_op + 5);
    }

    #[tokio::test]
    async fn check_quota_recalculates_stale_cache() {
        let (storage, user_id) = seeded(&[false, false, true, false, true]).await;
        let per_op = make_op(OpType::Create).payload_size() as u64;
        storage.set_quota(&user_id, 5 * per_op).await.unwrap();

        // Cache says full; compaction below frees space without refreshing.
        storage
            .delete_ops_through(&user_id, ServerSeq::new(3))
            .await
            .unwrap();
        let cached = storage.user_state(&user_id).await.unwrap().unwrap();
        assert_eq!(cached.storage_used_bytes, 5 * per_op);

        let check = check_quota(&storage, &user_id, per_op, QUOTA).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.used_bytes, 2 * per_op);
    }

    #[tokio::test]
    async fn check_quota_creates_account_with_default() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let user_id = UserId::new("fresh");
        let check = check_quota(&storage, &user_id, 10, 5).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.quota_bytes, 5);
    }
}
