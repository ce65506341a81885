//! Per-operation validation on ingest.
//!
//! A failed check rejects only the offending operation; the rest of the
//! batch is still processed.

use crate::config::Config;
use opsync_types::{EntityType, Operation, RejectCode};
use serde_json::Value;

/// Longest accepted operation or entity id.
pub const MAX_ID_LEN: usize = 255;

/// Supported payload schema versions.
pub const SCHEMA_VERSIONS: std::ops::RangeInclusive<u32> = 1..=100;

/// Deepest accepted payload nesting.
pub const MAX_PAYLOAD_DEPTH: usize = 20;

/// Most object keys plus array elements accepted in one payload.
pub const MAX_PAYLOAD_KEYS: usize = 20_000;

/// Limits applied to every uploaded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    /// Serialized payload size limit.
    pub max_payload_bytes: usize,
    /// Allowed future skew of `clientTimestamp`.
    pub max_clock_drift_ms: i64,
    /// Vector clock entry limit.
    pub max_vector_clock_entries: usize,
}

impl From<&Config> for ValidationLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_payload_bytes: config.storage.max_payload_bytes,
            max_clock_drift_ms: config.limits.max_clock_drift_ms,
            max_vector_clock_entries: config.limits.max_vector_clock_entries,
        }
    }
}

/// Why an operation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Wire code.
    pub code: RejectCode,
    /// Detail for the client.
    pub message: String,
}

impl Rejection {
    fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Check one operation against the limits.
///
/// `now_ms` is the server clock used for the drift check.
pub fn validate_operation(
    op: &Operation,
    limits: &ValidationLimits,
    now_ms: i64,
) -> Result<(), Rejection> {
    let id = op.id.as_str();
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(Rejection::new(
            RejectCode::InvalidOpId,
            format!("op id must be 1..={MAX_ID_LEN} characters"),
        ));
    }

    validate_entity(op)?;

    if !SCHEMA_VERSIONS.contains(&op.schema_version) {
        return Err(Rejection::new(
            RejectCode::InvalidSchemaVersion,
            format!("invalid schema version: {}", op.schema_version),
        ));
    }

    if op.vector_clock.len() > limits.max_vector_clock_entries {
        return Err(Rejection::new(
            RejectCode::VectorClockTooLarge,
            format!(
                "vector clock has {} entries (max {})",
                op.vector_clock.len(),
                limits.max_vector_clock_entries
            ),
        ));
    }

    // Snapshots are large by nature; only deltas get the complexity check.
    if !op.is_restore_point() && !within_complexity(&op.payload) {
        return Err(Rejection::new(
            RejectCode::PayloadTooComplex,
            format!("payload too complex (max depth {MAX_PAYLOAD_DEPTH}, max keys {MAX_PAYLOAD_KEYS})"),
        ));
    }

    let size = op.payload_size();
    if size > limits.max_payload_bytes {
        return Err(Rejection::new(
            RejectCode::PayloadTooLarge,
            format!("payload is {size} bytes (max {})", limits.max_payload_bytes),
        ));
    }

    if op.client_timestamp > now_ms.saturating_add(limits.max_clock_drift_ms) {
        return Err(Rejection::new(
            RejectCode::ClockDrift,
            "timestamp too far in future",
        ));
    }

    Ok(())
}

fn validate_entity(op: &Operation) -> Result<(), Rejection> {
    if op.is_restore_point() && op.entity_type != EntityType::All {
        return Err(Rejection::new(
            RejectCode::InvalidEntity,
            format!("{} must target ALL, not {}", op.op_type, op.entity_type),
        ));
    }

    match op.entity_id.as_deref() {
        Some(entity_id) if entity_id.len() > MAX_ID_LEN => Err(Rejection::new(
            RejectCode::InvalidEntity,
            format!("entity id longer than {MAX_ID_LEN} characters"),
        )),
        Some(entity_id) if entity_id.is_empty() && op.entity_type != EntityType::All => Err(
            Rejection::new(RejectCode::InvalidEntity, "entity id is empty"),
        ),
        None if op.entity_type != EntityType::All => Err(Rejection::new(
            RejectCode::InvalidEntity,
            format!("{} on {} requires an entity id", op.op_type, op.entity_type),
        )),
        _ => Ok(()),
    }
}

/// Depth-first walk counting keys; stops at the first limit breach.
fn within_complexity(payload: &Value) -> bool {
    let mut total_keys = 0usize;
    let mut stack = vec![(payload, 0usize)];

    while let Some((value, depth)) = stack.pop() {
        if depth > MAX_PAYLOAD_DEPTH {
            return false;
        }
        match value {
            Value::Array(items) => {
                total_keys += items.len();
                if total_keys > MAX_PAYLOAD_KEYS {
                    return false;
                }
                stack.extend(items.iter().map(|item| (item, depth + 1)));
            }
            Value::Object(map) => {
                total_keys += map.len();
                if total_keys > MAX_PAYLOAD_KEYS {
                    return false;
                }
                stack.extend(map.values().map(|item| (item, depth + 1)));
            }
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_types::{ClientId, OpId, OpType, VectorClock};
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn limits() -> ValidationLimits {
        ValidationLimits::from(&Config::default())
    }

    fn op(op_type: OpType, entity_type: EntityType, entity_id: Option<&str>) -> Operation {
        let client = ClientId::new("client-a");
        let mut clock = VectorClock::new();
        clock.increment(&client);
        Operation::new(
            client,
            op_type,
            entity_type,
            entity_id.map(str::to_string),
            json!({"title": "ok"}),
            clock,
            NOW,
        )
    }

    fn task_op() -> Operation {
        op(OpType::Create, EntityType::Task, Some("t1"))
    }

    fn code(op: &Operation) -> Option<RejectCode> {
        validate_operation(op, &limits(), NOW).err().map(|r| r.code)
    }

    #[test]
    fn valid_operation_passes() {
        assert_eq!(code(&task_op()), None);
        assert_eq!(code(&op(OpType::SyncImport, EntityType::All, None)), None);
    }

    #[test]
    fn op_id_length_checked() {
        let mut bad = task_op();
        bad.id = OpId::from_string("");
        assert_eq!(code(&bad), Some(RejectCode::InvalidOpId));

        bad.id = OpId::from_string("x".repeat(MAX_ID_LEN + 1));
        assert_eq!(code(&bad), Some(RejectCode::InvalidOpId));

        bad.id = OpId::from_string("x".repeat(MAX_ID_LEN));
        assert_eq!(code(&bad), None);
    }

    #[test]
    fn entity_id_required_unless_all() {
        assert_eq!(
            code(&op(OpType::Update, EntityType::Task, None)),
            Some(RejectCode::InvalidEntity)
        );
        assert_eq!(
            code(&op(OpType::Update, EntityType::Task, Some(""))),
            Some(RejectCode::InvalidEntity)
        );
        assert_eq!(code(&op(OpType::Update, EntityType::All, None)), None);
    }

    #[test]
    fn restore_point_must_target_all() {
        assert_eq!(
            code(&op(OpType::Repair, EntityType::Task, Some("t1"))),
            Some(RejectCode::InvalidEntity)
        );
    }

    #[test]
    fn schema_version_range() {
        let mut bad = task_op();
        bad.schema_version = 0;
        assert_eq!(code(&bad), Some(RejectCode::InvalidSchemaVersion));
        bad.schema_version = 101;
        assert_eq!(code(&bad), Some(RejectCode::InvalidSchemaVersion));
        bad.schema_version = 100;
        assert_eq!(code(&bad), None);
    }

    #[test]
    fn payload_size_limit() {
        let mut big = task_op();
        big.payload = json!({"blob": "x".repeat(200)});
        let tight = ValidationLimits {
            max_payload_bytes: 100,
            ..limits()
        };
        let rejection = validate_operation(&big, &tight, NOW).unwrap_err();
        assert_eq!(rejection.code, RejectCode::PayloadTooLarge);
    }

    #[test]
    fn future_timestamp_rejected() {
        let mut drifted = task_op();
        drifted.client_timestamp = NOW + limits().max_clock_drift_ms + 1;
        assert_eq!(code(&drifted), Some(RejectCode::ClockDrift));

        drifted.client_timestamp = NOW + limits().max_clock_drift_ms;
        assert_eq!(code(&drifted), None);
    }

    #[test]
    fn deep_payload_rejected() {
        let mut deep = json!("leaf");
        for _ in 0..=MAX_PAYLOAD_DEPTH {
            deep = json!({ "n": deep });
        }
        let mut nested = task_op();
        nested.payload = deep.clone();
        assert_eq!(code(&nested), Some(RejectCode::PayloadTooComplex));

        // Snapshots skip the complexity check.
        let mut snapshot = op(OpType::SyncImport, EntityType::All, None);
        snapshot.payload = deep;
        assert_eq!(code(&snapshot), None);
    }

    #[test]
    fn wide_payload_rejected() {
        let mut wide = task_op();
        wide.payload = json!(vec![0; MAX_PAYLOAD_KEYS + 1]);
        assert_eq!(code(&wide), Some(RejectCode::PayloadTooComplex));
    }

    #[test]
    fn oversized_vector_clock_rejected() {
        let mut crowded = task_op();
        for i in 0..=limits().max_vector_clock_entries {
            crowded.vector_clock.increment(&ClientId::new(format!("c{i}")));
        }
        assert_eq!(code(&crowded), Some(RejectCode::VectorClockTooLarge));
    }
}
