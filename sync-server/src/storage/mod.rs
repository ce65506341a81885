//! Storage layer for opsync-server.
//!
//! Per-account operation log with gap-free sequence assignment, plus the
//! bookkeeping tables around it: sync state, device registry, tombstones.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use opsync_types::{
    ClientId, EntityType, OpId, Operation, RestorePoint, ServerOperation, ServerSeq, UserId,
};

/// Per-account sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSyncState {
    /// Highest sequence ever assigned. Never decreases.
    pub last_seq: ServerSeq,
    /// Cached payload bytes stored for the account.
    pub storage_used_bytes: u64,
    /// Account quota in bytes.
    pub storage_quota_bytes: u64,
    /// Last successful compaction, ms since epoch.
    pub last_compacted_at: Option<i64>,
}

/// A device known to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDevice {
    /// Client id of the device.
    pub client_id: ClientId,
    /// First contact, ms since epoch.
    pub first_seen: i64,
    /// Latest contact, ms since epoch.
    pub last_seen: i64,
    /// Highest sequence delivered to the device.
    pub last_acked_seq: ServerSeq,
}

/// Record of an accepted delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// Kind of the deleted entity.
    pub entity_type: EntityType,
    /// Id of the deleted entity.
    pub entity_id: String,
    /// Server time of the delete, ms since epoch.
    pub deleted_at: i64,
    /// Sequence of the delete operation.
    pub deleted_seq: ServerSeq,
    /// Id of the delete operation.
    pub deleted_by_op_id: OpId,
    /// When the tombstone may be dropped regardless of acks.
    pub expires_at: i64,
}

/// Request to append one operation to an account's log.
#[derive(Debug, Clone)]
pub struct NewOperation<'a> {
    /// Owning account.
    pub user_id: &'a UserId,
    /// The validated operation.
    pub op: &'a Operation,
    /// Server receive time, ms since epoch.
    pub received_at: i64,
    /// Expiry for the tombstone a delete creates.
    pub tombstone_expires_at: i64,
}

/// Result of appending an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored under a fresh sequence.
    Inserted(ServerSeq),
    /// An operation with this id already exists for the account.
    Duplicate,
}

/// Rows and bytes removed by a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteStats {
    /// Operations removed.
    pub deleted_count: u64,
    /// Payload bytes removed.
    pub freed_bytes: u64,
}

/// Trait for operation log storage backends.
#[async_trait]
pub trait OpStorage: Send + Sync {
    /// Create the account's sync state if missing and return it.
    async fn ensure_user(
        &self,
        user_id: &UserId,
        quota_bytes: u64,
    ) -> Result<UserSyncState, StorageError>;

    /// Get the account's sync state.
    async fn user_state(&self, user_id: &UserId) -> Result<Option<UserSyncState>, StorageError>;

    /// Change an account's quota.
    async fn set_quota(&self, user_id: &UserId, quota_bytes: u64) -> Result<(), StorageError>;

    /// Whether an operation id is already stored for the account.
    async fn op_exists(&self, user_id: &UserId, op_id: &OpId) -> Result<bool, StorageError>;

    /// Append an operation, assigning `last_seq + 1`.
    ///
    /// Runs in one transaction: dedup check, sequence bump, insert, usage
    /// update, and the tombstone for a delete.
    async fn insert_operation(&self, req: NewOperation<'_>) -> Result<InsertOutcome, StorageError>;

    /// Lowest retained sequence, if any operations are stored.
    async fn min_seq(&self, user_id: &UserId) -> Result<Option<ServerSeq>, StorageError>;

    /// Operations with `after < serverSeq <= through`, ascending.
    ///
    /// Returns up to `limit` operations, leaving out `exclude`'s own.
    async fn ops_after(
        &self,
        user_id: &UserId,
        after: ServerSeq,
        through: ServerSeq,
        limit: u32,
        exclude: Option<&ClientId>,
    ) -> Result<Vec<ServerOperation>, StorageError>;

    /// Restore points, newest first.
    async fn list_restore_points(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<RestorePoint>, StorageError>;

    /// Restore points, oldest first.
    async fn oldest_restore_points(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<RestorePoint>, StorageError>;

    /// Delete operations with `serverSeq <= seq`.
    async fn delete_ops_through(
        &self,
        user_id: &UserId,
        seq: ServerSeq,
    ) -> Result<DeleteStats, StorageError>;

    /// Delete every operation and tombstone of the account.
    ///
    /// The sequence counter is kept, so sequences are never reused.
    async fn delete_all(&self, user_id: &UserId) -> Result<DeleteStats, StorageError>;

    /// Sum payload sizes from the operations table.
    async fn calculate_usage(&self, user_id: &UserId) -> Result<u64, StorageError>;

    /// Recalculate usage and write it to the cached counter.
    async fn refresh_usage(&self, user_id: &UserId) -> Result<u64, StorageError>;

    /// Record a successful compaction.
    async fn mark_compacted(&self, user_id: &UserId, now: i64) -> Result<(), StorageError>;

    /// Register the device or update its last-seen time.
    async fn touch_device(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        now: i64,
    ) -> Result<(), StorageError>;

    /// Record that the device received everything through `seq`.
    async fn ack_device(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        seq: ServerSeq,
        now: i64,
    ) -> Result<(), StorageError>;

    /// Get a device record.
    async fn get_device(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
    ) -> Result<Option<SyncDevice>, StorageError>;

    /// Count devices seen at or after `since`.
    async fn devices_online(&self, user_id: &UserId, since: i64) -> Result<u64, StorageError>;

    /// Get the tombstone for an entity.
    async fn get_tombstone(
        &self,
        user_id: &UserId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<Tombstone>, StorageError>;

    /// Drop tombstones that expired or that every known device has passed.
    ///
    /// Returns the number of tombstones deleted.
    async fn cleanup_tombstones(&self, now: i64) -> Result<u64, StorageError>;

    /// Forget devices last seen before `cutoff`.
    ///
    /// Returns the number of devices deleted.
    async fn cleanup_stale_devices(&self, cutoff: i64) -> Result<u64, StorageError>;

    /// Operations stored across all accounts.
    async fn total_operations(&self) -> Result<u64, StorageError>;

    /// Payload bytes stored across all accounts.
    async fn total_storage_bytes(&self) -> Result<u64, StorageError>;

    /// Accounts with sync state.
    async fn total_accounts(&self) -> Result<u64, StorageError>;
}
