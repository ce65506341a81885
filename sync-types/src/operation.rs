//! Operations: the atomic, immutable unit of change.

use crate::error::TypesError;
use crate::ids::{ClientId, OpId, ServerSeq};
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Kind of change an operation carries.
///
/// The last three kinds are *restore points*: they carry a complete state
/// snapshot instead of a delta and make every earlier operation redundant
/// for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// Create an entity.
    #[serde(rename = "CRT")]
    Create,
    /// Update fields of an entity.
    #[serde(rename = "UPD")]
    Update,
    /// Delete an entity.
    #[serde(rename = "DEL")]
    Delete,
    /// Move an entity (reparent or reorder).
    #[serde(rename = "MOV")]
    Move,
    /// Several changes to one entity type applied together.
    #[serde(rename = "BATCH")]
    Batch,
    /// Full state upload after a sync reset or password rotation.
    #[serde(rename = "SYNC_IMPORT")]
    SyncImport,
    /// Full state restored from a backup file.
    #[serde(rename = "BACKUP_IMPORT")]
    BackupImport,
    /// Full state written by a repair pass.
    #[serde(rename = "REPAIR")]
    Repair,
}

impl OpType {
    /// All kinds, in wire order.
    pub const ALL: [OpType; 8] = [
        OpType::Create,
        OpType::Update,
        OpType::Delete,
        OpType::Move,
        OpType::Batch,
        OpType::SyncImport,
        OpType::BackupImport,
        OpType::Repair,
    ];

    /// True for snapshot-carrying kinds.
    pub fn is_restore_point(&self) -> bool {
        matches!(
            self,
            OpType::SyncImport | OpType::BackupImport | OpType::Repair
        )
    }

    /// Wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Create => "CRT",
            OpType::Update => "UPD",
            OpType::Delete => "DEL",
            OpType::Move => "MOV",
            OpType::Batch => "BATCH",
            OpType::SyncImport => "SYNC_IMPORT",
            OpType::BackupImport => "BACKUP_IMPORT",
            OpType::Repair => "REPAIR",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TypesError::UnknownOpType(s.to_string()))
    }
}

/// Kind of entity an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// A task; tasks form a parent/subtask hierarchy.
    Task,
    /// A project grouping tasks.
    Project,
    /// A tag.
    Tag,
    /// A free-form note.
    Note,
    /// Singleton application configuration.
    GlobalConfig,
    /// Time tracking records.
    TimeTracking,
    /// A simple counter.
    SimpleCounter,
    /// A work context (project or tag view).
    WorkContext,
    /// A repeating-task configuration.
    TaskRepeatCfg,
    /// An issue provider integration.
    IssueProvider,
    /// Planner day assignments.
    Planner,
    /// Menu tree layout.
    MenuTree,
    /// A daily metric entry.
    Metric,
    /// A board.
    Board,
    /// A reminder.
    Reminder,
    /// A data migration marker.
    Migration,
    /// A recovery marker.
    Recovery,
    /// The whole application state (restore points).
    All,
    /// Plugin-owned user data.
    PluginUserData,
    /// Plugin metadata.
    PluginMetadata,
}

impl EntityType {
    /// Every entity type.
    pub const ALL_TYPES: [EntityType; 20] = [
        EntityType::Task,
        EntityType::Project,
        EntityType::Tag,
        EntityType::Note,
        EntityType::GlobalConfig,
        EntityType::TimeTracking,
        EntityType::SimpleCounter,
        EntityType::WorkContext,
        EntityType::TaskRepeatCfg,
        EntityType::IssueProvider,
        EntityType::Planner,
        EntityType::MenuTree,
        EntityType::Metric,
        EntityType::Board,
        EntityType::Reminder,
        EntityType::Migration,
        EntityType::Recovery,
        EntityType::All,
        EntityType::PluginUserData,
        EntityType::PluginMetadata,
    ];

    /// Wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Task => "TASK",
            EntityType::Project => "PROJECT",
            EntityType::Tag => "TAG",
            EntityType::Note => "NOTE",
            EntityType::GlobalConfig => "GLOBAL_CONFIG",
            EntityType::TimeTracking => "TIME_TRACKING",
            EntityType::SimpleCounter => "SIMPLE_COUNTER",
            EntityType::WorkContext => "WORK_CONTEXT",
            EntityType::TaskRepeatCfg => "TASK_REPEAT_CFG",
            EntityType::IssueProvider => "ISSUE_PROVIDER",
            EntityType::Planner => "PLANNER",
            EntityType::MenuTree => "MENU_TREE",
            EntityType::Metric => "METRIC",
            EntityType::Board => "BOARD",
            EntityType::Reminder => "REMINDER",
            EntityType::Migration => "MIGRATION",
            EntityType::Recovery => "RECOVERY",
            EntityType::All => "ALL",
            EntityType::PluginUserData => "PLUGIN_USER_DATA",
            EntityType::PluginMetadata => "PLUGIN_METADATA",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL_TYPES
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TypesError::UnknownEntityType(s.to_string()))
    }
}

/// A client-authored change record.
///
/// Uploaded without `serverSeq`/`receivedAt`; the server assigns both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Globally unique id; the idempotency key.
    pub id: OpId,
    /// Writing client.
    pub client_id: ClientId,
    /// Human-readable label for debugging (e.g. `"[Task] Add"`).
    pub action_type: String,
    /// Kind of change.
    pub op_type: OpType,
    /// Kind of entity touched.
    pub entity_type: EntityType,
    /// Entity id; `None` for whole-state operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Delta, snapshot, or (when encrypted) a base64 string.
    pub payload: serde_json::Value,
    /// Writer's causal history at the time of the write.
    pub vector_clock: VectorClock,
    /// Writer's wall clock, milliseconds since the Unix epoch.
    pub client_timestamp: i64,
    /// Schema version of `payload`.
    pub schema_version: u32,
    /// Whether `payload` is an encrypted blob.
    #[serde(default)]
    pub is_payload_encrypted: bool,
}

impl Operation {
    /// Build an unencrypted operation at the current schema version.
    pub fn new(
        client_id: ClientId,
        op_type: OpType,
        entity_type: EntityType,
        entity_id: Option<String>,
        payload: serde_json::Value,
        vector_clock: VectorClock,
        client_timestamp: i64,
    ) -> Self {
        Self {
            id: OpId::new(),
            action_type: format!("[{}] {}", entity_type, op_type),
            client_id,
            op_type,
            entity_type,
            entity_id,
            payload,
            vector_clock,
            client_timestamp,
            schema_version: CURRENT_SCHEMA_VERSION,
            is_payload_encrypted: false,
        }
    }

    /// True for snapshot-carrying operations.
    pub fn is_restore_point(&self) -> bool {
        self.op_type.is_restore_point()
    }

    /// Entity id, or the empty string for whole-state operations.
    pub fn entity_key(&self) -> &str {
        self.entity_id.as_deref().unwrap_or("")
    }

    /// Size of the payload as stored (serialized JSON bytes).
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

/// An operation as stored and served by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOperation {
    /// The accepted operation, unchanged.
    #[serde(flatten)]
    pub op: Operation,
    /// Sequence assigned on acceptance.
    pub server_seq: ServerSeq,
    /// Server wall clock at acceptance (audit only).
    pub received_at: i64,
}
