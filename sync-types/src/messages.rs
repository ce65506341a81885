//! Request and response bodies for the sync wire protocol.
//!
//! All bodies are JSON with camelCase field names. The account is carried
//! out of band (see the server's HTTP layer); nothing here names it.

use serde::{Deserialize, Serialize};

use crate::{ClientId, OpId, OpType, Operation, ServerOperation, ServerSeq};

/// Default page size for downloads.
pub const DEFAULT_DOWNLOAD_LIMIT: u32 = 500;

/// Largest page a download may request.
pub const MAX_DOWNLOAD_LIMIT: u32 = 1000;

/// Upper bound on operations piggybacked onto an upload reply.
pub const PIGGYBACK_LIMIT: u32 = 100;

/// Upload a batch of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    /// Uploading client.
    pub client_id: ClientId,
    /// Operations without server-assigned fields.
    pub ops: Vec<Operation>,
    /// When set, the reply carries other clients' ops newer than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_server_seq: Option<ServerSeq>,
    /// Retry key; a repeated id replays the cached results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Why the server refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    /// Missing or overlong id.
    InvalidOpId,
    /// Missing entity id, or restore point not targeting `ALL`.
    InvalidEntity,
    /// Schema version outside the supported range.
    InvalidSchemaVersion,
    /// Payload exceeds the size limit.
    PayloadTooLarge,
    /// Client timestamp too far in the future.
    ClockDrift,
    /// Payload nesting or key count exceeds limits.
    PayloadTooComplex,
    /// Vector clock has too many entries.
    VectorClockTooLarge,
    /// Storage failure while persisting this op.
    Internal,
}

/// Per-operation outcome of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UploadStatus {
    /// Stored under a fresh sequence number.
    #[serde(rename_all = "camelCase")]
    Accepted {
        /// Sequence assigned to the op.
        server_seq: ServerSeq,
    },
    /// Already stored earlier; treated as success.
    Duplicate,
    /// Refused permanently; retrying the same op will not help.
    #[serde(rename_all = "camelCase")]
    Rejected {
        /// Machine-readable reason.
        code: RejectCode,
        /// Human-readable detail.
        message: String,
    },
    /// Refused because the account is over quota; needs user action.
    #[serde(rename_all = "camelCase")]
    QuotaExceeded {
        /// Recalculated usage.
        used_bytes: u64,
        /// Account quota.
        quota_bytes: u64,
    },
}

impl UploadStatus {
    /// Accepted or duplicate: the op is safely on the server.
    pub fn is_stored(&self) -> bool {
        matches!(self, UploadStatus::Accepted { .. } | UploadStatus::Duplicate)
    }
}

/// Outcome for one uploaded operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    /// Operation the status refers to.
    pub op_id: OpId,
    /// The outcome.
    #[serde(flatten)]
    pub status: UploadStatus,
}

/// Reply to an [`UploadRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// One result per uploaded op, in request order.
    pub results: Vec<UploadResult>,
    /// Highest sequence stored for the account.
    pub latest_seq: ServerSeq,
    /// Other clients' ops newer than `lastKnownServerSeq`, if requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_ops: Vec<ServerOperation>,
    /// True when the results were replayed from the request cache.
    #[serde(default)]
    pub deduplicated: bool,
}

/// Query for a download page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Return ops with `serverSeq > since_seq`.
    pub since_seq: ServerSeq,
    /// Page size; defaults to [`DEFAULT_DOWNLOAD_LIMIT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Leave out this client's own ops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_client: Option<ClientId>,
}

/// A page of operations, ascending by sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    /// Operations, ascending by `serverSeq`.
    pub ops: Vec<ServerOperation>,
    /// More ops exist past this page.
    pub has_more: bool,
    /// Highest sequence stored for the account.
    pub latest_seq: ServerSeq,
    /// The requested range is not contiguous with stored history; the
    /// client should reset its cursor and replay from a restore point.
    #[serde(default)]
    pub gap_detected: bool,
}

impl DownloadResponse {
    /// Highest sequence in this page, if any.
    pub fn last_seq(&self) -> Option<ServerSeq> {
        self.ops.last().map(|op| op.server_seq)
    }
}

/// Account sync status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Highest stored sequence.
    pub latest_seq: ServerSeq,
    /// Devices seen within the online window.
    pub devices_online: u64,
    /// Bytes of stored payloads.
    pub storage_used_bytes: u64,
    /// Account quota in bytes.
    pub storage_quota_bytes: u64,
}

/// A restore point retained on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePoint {
    /// Sequence of the snapshot op.
    pub server_seq: ServerSeq,
    /// Operation id.
    pub op_id: OpId,
    /// Snapshot kind.
    pub op_type: OpType,
    /// Client that wrote it.
    pub client_id: ClientId,
    /// Server receive time, ms since epoch.
    pub created_at: i64,
}

/// List of restore points, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePointsResponse {
    /// Restore points.
    pub restore_points: Vec<RestorePoint>,
}

/// Result of a compaction run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactResponse {
    /// False when nothing could be reclaimed.
    pub success: bool,
    /// Operations removed.
    pub deleted_count: u64,
    /// Payload bytes reclaimed.
    pub freed_bytes: u64,
}

/// Result of deleting all of an account's operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAllResponse {
    /// Operations removed.
    pub deleted_count: u64,
}

/// Error body returned with non-2xx HTTP statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable code, e.g. `STORAGE_QUOTA_EXCEEDED`.
    pub error_code: String,
    /// Usage at rejection time (quota errors only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_used_bytes: Option<u64>,
    /// Quota at rejection time (quota errors only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_quota_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_status_is_tagged() {
        let result = UploadResult {
            op_id: OpId::from_string("op-1"),
            status: UploadStatus::Accepted {
                server_seq: ServerSeq::new(7),
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["opId"], "op-1");
        assert_eq!(value["status"], "accepted");
        assert_eq!(value["serverSeq"], 7);

        let back: UploadResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn quota_exceeded_is_distinct_from_rejected() {
        let quota = UploadStatus::QuotaExceeded {
            used_bytes: 10,
            quota_bytes: 5,
        };
        let value = serde_json::to_value(&quota).unwrap();
        assert_eq!(value["status"], "quotaExceeded");
        assert_eq!(value["usedBytes"], 10);
        assert!(!quota.is_stored());
        assert!(UploadStatus::Duplicate.is_stored());
    }

    #[test]
    fn reject_code_wire_names() {
        let status = UploadStatus::Rejected {
            code: RejectCode::PayloadTooLarge,
            message: "too big".into(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["code"], "PAYLOAD_TOO_LARGE");
    }

    #[test]
    fn upload_response_omits_empty_new_ops() {
        let response = UploadResponse {
            results: vec![],
            latest_seq: ServerSeq::new(3),
            new_ops: vec![],
            deduplicated: false,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("newOps").is_none());

        let parsed: UploadResponse =
            serde_json::from_str(r#"{"results":[],"latestSeq":3}"#).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn download_last_seq() {
        let empty = DownloadResponse {
            ops: vec![],
            has_more: false,
            latest_seq: ServerSeq::zero(),
            gap_detected: false,
        };
        assert_eq!(empty.last_seq(), None);
    }
}
