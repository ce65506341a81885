//! SQLite storage backend for opsync-server.

use super::{
    DeleteStats, InsertOutcome, NewOperation, OpStorage, SyncDevice, Tombstone, UserSyncState,
};
use crate::error::StorageError;
use async_trait::async_trait;
use opsync_types::{
    ClientId, EntityType, OpId, OpType, Operation, RestorePoint, ServerOperation, ServerSeq,
    UserId, VectorClock,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Restore-point kinds as stored in `operations.op_type`.
const RESTORE_POINT_TYPES: &str = "('SYNC_IMPORT', 'BACKUP_IMPORT', 'REPAIR')";

/// SQLite-based operation log storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("connections", &self.pool.size())
            .finish()
    }
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_sync_state (
                user_id TEXT PRIMARY KEY,
                last_seq INTEGER NOT NULL DEFAULT 0,
                storage_used_bytes INTEGER NOT NULL DEFAULT 0,
                storage_quota_bytes INTEGER NOT NULL,
                last_compacted_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                user_id TEXT NOT NULL,
                op_id TEXT NOT NULL,
                server_seq INTEGER NOT NULL,
                client_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                op_type TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT,
                payload TEXT NOT NULL,
                payload_size INTEGER NOT NULL,
                vector_clock TEXT NOT NULL,
                client_timestamp INTEGER NOT NULL,
                schema_version INTEGER NOT NULL,
                is_payload_encrypted INTEGER NOT NULL DEFAULT 0,
                received_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, op_id),
                UNIQUE(user_id, server_seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_devices (
                user_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                last_acked_seq INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, client_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tombstones (
                user_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                deleted_at INTEGER NOT NULL,
                deleted_seq INTEGER NOT NULL,
                deleted_by_op_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, entity_type, entity_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        // Create indexes
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_operations_user_seq ON operations(user_id, server_seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_operations_user_type ON operations(user_id, op_type)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tombstones_expires ON tombstones(expires_at)")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON sync_devices(last_seen)")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(())
    }
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl OpStorage for SqliteStorage {
    async fn ensure_user(
        &self,
        user_id: &UserId,
        quota_bytes: u64,
    ) -> Result<UserSyncState, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO user_sync_state (user_id, storage_quota_bytes)
            VALUES (?1, ?2)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id.as_str())
        .bind(to_db(quota_bytes))
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        self.user_state(user_id)
            .await?
            .ok_or_else(|| StorageError::UnknownAccount {
                user_id: user_id.to_string(),
            })
    }

    async fn user_state(&self, user_id: &UserId) -> Result<Option<UserSyncState>, StorageError> {
        let row = sqlx::query_as::<_, UserStateRow>(
            r#"
            SELECT last_seq, storage_used_bytes, storage_quota_bytes, last_compacted_at
            FROM user_sync_state
            WHERE user_id = ?1
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(row.map(UserSyncState::from))
    }

    async fn set_quota(&self, user_id: &UserId, quota_bytes: u64) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO user_sync_state (user_id, storage_quota_bytes)
            VALUES (?1, ?2)
            ON CONFLICT(user_id) DO UPDATE SET storage_quota_bytes = ?2
            "#,
        )
        .bind(user_id.as_str())
        .bind(to_db(quota_bytes))
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn op_exists(&self, user_id: &UserId, op_id: &OpId) -> Result<bool, StorageError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM operations WHERE user_id = ?1 AND op_id = ?2",
        )
        .bind(user_id.as_str())
        .bind(op_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(found.is_some())
    }

    async fn insert_operation(&self, req: NewOperation<'_>) -> Result<InsertOutcome, StorageError> {
        let op = req.op;
        let user = req.user_id.as_str();
        let payload = serde_json::to_string(&op.payload)?;
        let vector_clock = serde_json::to_string(&op.vector_clock)?;
        let payload_size = op.payload_size() as i64;

        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM operations WHERE user_id = ?1 AND op_id = ?2",
        )
        .bind(user)
        .bind(op.id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        if existing.is_some() {
            tx.rollback().await.map_err(StorageError::Database)?;
            return Ok(InsertOutcome::Duplicate);
        }

        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE user_sync_state
            SET last_seq = last_seq + 1,
                storage_used_bytes = storage_used_bytes + ?2
            WHERE user_id = ?1
            RETURNING last_seq
            "#,
        )
        .bind(user)
        .bind(payload_size)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let seq = seq.ok_or_else(|| StorageError::UnknownAccount {
            user_id: user.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO operations (
                user_id, op_id, server_seq, client_id, action_type, op_type, entity_type,
                entity_id, payload, payload_size, vector_clock, client_timestamp,
                schema_version, is_payload_encrypted, received_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(user)
        .bind(op.id.as_str())
        .bind(seq)
        .bind(op.client_id.as_str())
        .bind(&op.action_type)
        .bind(op.op_type.as_str())
        .bind(op.entity_type.as_str())
        .bind(op.entity_id.as_deref())
        .bind(&payload)
        .bind(payload_size)
        .bind(&vector_clock)
        .bind(op.client_timestamp)
        .bind(i64::from(op.schema_version))
        .bind(op.is_payload_encrypted)
        .bind(req.received_at)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        if let (OpType::Delete, Some(entity_id)) = (op.op_type, op.entity_id.as_deref()) {
            sqlx::query(
                r#"
                INSERT INTO tombstones (
                    user_id, entity_type, entity_id, deleted_at, deleted_seq,
                    deleted_by_op_id, expires_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(user_id, entity_type, entity_id) DO UPDATE SET
                    deleted_at = ?4,
                    deleted_seq = ?5,
                    deleted_by_op_id = ?6,
                    expires_at = ?7
                "#,
            )
            .bind(user)
            .bind(op.entity_type.as_str())
            .bind(entity_id)
            .bind(req.received_at)
            .bind(seq)
            .bind(op.id.as_str())
            .bind(req.tombstone_expires_at)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;
        }

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(InsertOutcome::Inserted(ServerSeq::new(from_db(seq))))
    }

    async fn min_seq(&self, user_id: &UserId) -> Result<Option<ServerSeq>, StorageError> {
        let min: Option<i64> =
            sqlx::query_scalar("SELECT MIN(server_seq) FROM operations WHERE user_id = ?1")
                .bind(user_id.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(StorageError::Database)?;

        Ok(min.map(|seq| ServerSeq::new(from_db(seq))))
    }

    async fn ops_after(
        &self,
        user_id: &UserId,
        after: ServerSeq,
        through: ServerSeq,
        limit: u32,
        exclude: Option<&ClientId>,
    ) -> Result<Vec<ServerOperation>, StorageError> {
        let rows = sqlx::query_as::<_, OperationRow>(
            r#"
            SELECT op_id, server_seq, client_id, action_type, op_type, entity_type, entity_id,
                   payload, vector_clock, client_timestamp, schema_version,
                   is_payload_encrypted, received_at
            FROM operations
            WHERE user_id = ?1
              AND server_seq > ?2
              AND server_seq <= ?3
              AND (?4 IS NULL OR client_id != ?4)
            ORDER BY server_seq ASC
            LIMIT ?5
            "#,
        )
        .bind(user_id.as_str())
        .bind(to_db(after.value()))
        .bind(to_db(through.value()))
        .bind(exclude.map(|c| c.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    async fn list_restore_points(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<RestorePoint>, StorageError> {
        let sql = format!(
            r#"
            SELECT op_id, server_seq, op_type, client_id, received_at
            FROM operations
            WHERE user_id = ?1 AND op_type IN {RESTORE_POINT_TYPES}
            ORDER BY server_seq DESC
            LIMIT ?2
            "#
        );
        let rows = sqlx::query_as::<_, RestorePointRow>(&sql)
            .bind(user_id.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    async fn oldest_restore_points(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<RestorePoint>, StorageError> {
        let sql = format!(
            r#"
            SELECT op_id, server_seq, op_type, client_id, received_at
            FROM operations
            WHERE user_id = ?1 AND op_type IN {RESTORE_POINT_TYPES}
            ORDER BY server_seq ASC
            LIMIT ?2
            "#
        );
        let rows = sqlx::query_as::<_, RestorePointRow>(&sql)
            .bind(user_id.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    async fn delete_ops_through(
        &self,
        user_id: &UserId,
        seq: ServerSeq,
    ) -> Result<DeleteStats, StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        let (count, bytes): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(payload_size), 0)
            FROM operations
            WHERE user_id = ?1 AND server_seq <= ?2
            "#,
        )
        .bind(user_id.as_str())
        .bind(to_db(seq.value()))
        .fetch_one(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query("DELETE FROM operations WHERE user_id = ?1 AND server_seq <= ?2")
            .bind(user_id.as_str())
            .bind(to_db(seq.value()))
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        tx.commit().await.map_err(StorageError::Database)?;

        Ok(DeleteStats {
            deleted_count: from_db(count),
            freed_bytes: from_db(bytes),
        })
    }

    async fn delete_all(&self, user_id: &UserId) -> Result<DeleteStats, StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        let (count, bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(payload_size), 0) FROM operations WHERE user_id = ?1",
        )
        .bind(user_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query("DELETE FROM operations WHERE user_id = ?1")
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        sqlx::query("DELETE FROM tombstones WHERE user_id = ?1")
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        sqlx::query("UPDATE user_sync_state SET storage_used_bytes = 0 WHERE user_id = ?1")
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        tx.commit().await.map_err(StorageError::Database)?;

        Ok(DeleteStats {
            deleted_count: from_db(count),
            freed_bytes: from_db(bytes),
        })
    }

    async fn calculate_usage(&self, user_id: &UserId) -> Result<u64, StorageError> {
        let size: Option<i64> =
            sqlx::query_scalar("SELECT SUM(payload_size) FROM operations WHERE user_id = ?1")
                .bind(user_id.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(StorageError::Database)?;

        Ok(from_db(size.unwrap_or(0)))
    }

    async fn refresh_usage(&self, user_id: &UserId) -> Result<u64, StorageError> {
        let size: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE user_sync_state
            SET storage_used_bytes = (
                SELECT COALESCE(SUM(payload_size), 0) FROM operations WHERE user_id = ?1
            )
            WHERE user_id = ?1
            RETURNING storage_used_bytes
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(from_db(size.unwrap_or(0)))
    }

    async fn mark_compacted(&self, user_id: &UserId, now: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE user_sync_state SET last_compacted_at = ?2 WHERE user_id = ?1")
            .bind(user_id.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn touch_device(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        now: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sync_devices (user_id, client_id, first_seen, last_seen)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(user_id, client_id) DO UPDATE SET last_seen = ?3
            "#,
        )
        .bind(user_id.as_str())
        .bind(client_id.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn ack_device(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        seq: ServerSeq,
        now: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sync_devices (user_id, client_id, first_seen, last_seen, last_acked_seq)
            VALUES (?1, ?2, ?3, ?3, ?4)
            ON CONFLICT(user_id, client_id) DO UPDATE SET
                last_seen = ?3,
                last_acked_seq = MAX(last_acked_seq, ?4)
            "#,
        )
        .bind(user_id.as_str())
        .bind(client_id.as_str())
        .bind(now)
        .bind(to_db(seq.value()))
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
    ) -> Result<Option<SyncDevice>, StorageError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT client_id, first_seen, last_seen, last_acked_seq
            FROM sync_devices
            WHERE user_id = ?1 AND client_id = ?2
            "#,
        )
        .bind(user_id.as_str())
        .bind(client_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(row.map(SyncDevice::from))
    }

    async fn devices_online(&self, user_id: &UserId, since: i64) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_devices WHERE user_id = ?1 AND last_seen >= ?2",
        )
        .bind(user_id.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(from_db(count))
    }

    async fn get_tombstone(
        &self,
        user_id: &UserId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<Tombstone>, StorageError> {
        let row = sqlx::query_as::<_, TombstoneRow>(
            r#"
            SELECT entity_type, entity_id, deleted_at, deleted_seq, deleted_by_op_id, expires_at
            FROM tombstones
            WHERE user_id = ?1 AND entity_type = ?2 AND entity_id = ?3
            "#,
        )
        .bind(user_id.as_str())
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        row.map(Tombstone::try_from).transpose()
    }

    async fn cleanup_tombstones(&self, now: i64) -> Result<u64, StorageError> {
        // A tombstone is no longer needed once every registered device has
        // received the delete. With no devices, MIN() is NULL and only
        // expiry applies.
        let result = sqlx::query(
            r#"
            DELETE FROM tombstones
            WHERE expires_at <= ?1
               OR deleted_seq <= (
                   SELECT MIN(d.last_acked_seq) FROM sync_devices d
                   WHERE d.user_id = tombstones.user_id
               )
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(result.rows_affected())
    }

    async fn cleanup_stale_devices(&self, cutoff: i64) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM sync_devices WHERE last_seen < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(result.rows_affected())
    }

    async fn total_operations(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM operations")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(from_db(count))
    }

    async fn total_storage_bytes(&self) -> Result<u64, StorageError> {
        let size: Option<i64> = sqlx::query_scalar("SELECT SUM(payload_size) FROM operations")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(from_db(size.unwrap_or(0)))
    }

    async fn total_accounts(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_sync_state")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(from_db(count))
    }
}

/// Internal row type for operation queries.
#[derive(sqlx::FromRow)]
struct OperationRow {
    op_id: String,
    server_seq: i64,
    client_id: String,
    action_type: String,
    op_type: String,
    entity_type: String,
    entity_id: Option<String>,
    payload: String,
    vector_clock: String,
    client_timestamp: i64,
    schema_version: i64,
    is_payload_encrypted: bool,
    received_at: i64,
}

impl TryFrom<OperationRow> for ServerOperation {
    type Error = StorageError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt {
            op_id: row.op_id.clone(),
            reason,
        };

        let op_type = OpType::from_str(&row.op_type).map_err(|e| corrupt(e.to_string()))?;
        let entity_type =
            EntityType::from_str(&row.entity_type).map_err(|e| corrupt(e.to_string()))?;
        let payload: serde_json::Value =
            serde_json::from_str(&row.payload).map_err(|e| corrupt(format!("payload: {e}")))?;
        let vector_clock: VectorClock = serde_json::from_str(&row.vector_clock)
            .map_err(|e| corrupt(format!("vector clock: {e}")))?;
        let schema_version = u32::try_from(row.schema_version)
            .map_err(|_| corrupt(format!("schema version {}", row.schema_version)))?;

        Ok(ServerOperation {
            op: Operation {
                id: OpId::from_string(row.op_id),
                client_id: ClientId::new(row.client_id),
                action_type: row.action_type,
                op_type,
                entity_type,
                entity_id: row.entity_id,
                payload,
                vector_clock,
                client_timestamp: row.client_timestamp,
                schema_version,
                is_payload_encrypted: row.is_payload_encrypted,
            },
            server_seq: ServerSeq::new(from_db(row.server_seq)),
            received_at: row.received_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RestorePointRow {
    op_id: String,
    server_seq: i64,
    op_type: String,
    client_id: String,
    received_at: i64,
}

impl TryFrom<RestorePointRow> for RestorePoint {
    type Error = StorageError;

    fn try_from(row: RestorePointRow) -> Result<Self, Self::Error> {
        let op_type = OpType::from_str(&row.op_type).map_err(|e| StorageError::Corrupt {
            op_id: row.op_id.clone(),
            reason: e.to_string(),
        })?;

        Ok(RestorePoint {
            server_seq: ServerSeq::new(from_db(row.server_seq)),
            op_id: OpId::from_string(row.op_id),
            op_type,
            client_id: ClientId::new(row.client_id),
            created_at: row.received_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserStateRow {
    last_seq: i64,
    storage_used_bytes: i64,
    storage_quota_bytes: i64,
    last_compacted_at: Option<i64>,
}

impl From<UserStateRow> for UserSyncState {
    fn from(row: UserStateRow) -> Self {
        UserSyncState {
            last_seq: ServerSeq::new(from_db(row.last_seq)),
            storage_used_bytes: from_db(row.storage_used_bytes),
            storage_quota_bytes: from_db(row.storage_quota_bytes),
            last_compacted_at: row.last_compacted_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    client_id: String,
    first_seen: i64,
    last_seen: i64,
    last_acked_seq: i64,
}

impl From<DeviceRow> for SyncDevice {
    fn from(row: DeviceRow) -> Self {
        SyncDevice {
            client_id: ClientId::new(row.client_id),
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            last_acked_seq: ServerSeq::new(from_db(row.last_acked_seq)),
        }
    }
}

#[derive(sqlx::FromRow)]
struct TombstoneRow {
    entity_type: String,
    entity_id: String,
    deleted_at: i64,
    deleted_seq: i64,
    deleted_by_op_id: String,
    expires_at: i64,
}

impl TryFrom<TombstoneRow> for Tombstone {
    type Error = StorageError;

    fn try_from(row: TombstoneRow) -> Result<Self, Self::Error> {
        let entity_type =
            EntityType::from_str(&row.entity_type).map_err(|e| StorageError::Corrupt {
                op_id: row.deleted_by_op_id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Tombstone {
            entity_type,
            entity_id: row.entity_id,
            deleted_at: row.deleted_at,
            deleted_seq: ServerSeq::new(from_db(row.deleted_seq)),
            deleted_by_op_id: OpId::from_string(row.deleted_by_op_id),
            expires_at: row.expires_at,
        })
    }
}
