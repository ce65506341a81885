//! Client-side operation log.
//!
//! The log holds:
//! - the device's vector clock and client id
//! - pending operations, in write order, until the server confirms them
//! - operations the server refused, with the reason
//! - downloaded operations held back for a newer schema
//! - the server cursor (highest sequence fully applied locally)
//! - errors recorded while applying remote operations
//!
//! Operations flow through the log in this order:
//! 1. `prepare()` then `enqueue()` - stamp, then append to pending once applied
//! 2. `pending_batch()` - copy the batch to upload (pending is unchanged)
//! 3. `ack()` / `reject()` - remove once the server has answered
//!
//! If an upload fails nothing is acknowledged, so the next cycle resends the
//! same batch unchanged. The whole log is serde-serializable so callers can
//! persist it between runs.

use opsync_types::{
    ClientId, EntityType, OpId, OpType, Operation, ServerOperation, ServerSeq, VectorClock,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

/// Most recent errors kept for repair tooling.
pub const MAX_RECORDED_ERRORS: usize = 100;

/// Error type for log operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// Pending queue is at capacity
    #[error("operation log full (capacity: {capacity})")]
    Full {
        /// Maximum pending operations.
        capacity: usize,
    },
}

/// An operation the server refused permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOp {
    /// The refused operation.
    pub op: Operation,
    /// Machine-readable reason.
    pub code: String,
    /// Human-readable reason.
    pub message: String,
}

/// A remote operation that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedError {
    /// Offending operation.
    pub op_id: OpId,
    /// Its entity type.
    pub entity_type: EntityType,
    /// Its entity id, if any.
    pub entity_id: Option<String>,
    /// What went wrong.
    pub reason: String,
    /// When it was recorded, ms since epoch.
    pub recorded_at: i64,
}

/// Append-only local log of a device's operations plus sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogStore {
    client_id: ClientId,
    clock: VectorClock,
    max_pending: usize,
    pending: VecDeque<Operation>,
    #[serde(default)]
    rejected: Vec<RejectedOp>,
    #[serde(default)]
    held_back: Vec<ServerOperation>,
    last_server_seq: ServerSeq,
    /// Highest timestamp written or observed; local timestamps never go below it.
    last_timestamp: i64,
    /// Last time an operation from each client was observed.
    #[serde(default)]
    last_seen: BTreeMap<ClientId, i64>,
    #[serde(default)]
    errors: VecDeque<RecordedError>,
}

impl OperationLogStore {
    /// Create an empty log for `client_id`.
    ///
    /// `max_pending` bounds the number of unconfirmed operations.
    pub fn new(client_id: ClientId, max_pending: usize) -> Self {
        Self {
            client_id,
            clock: VectorClock::new(),
            max_pending,
            pending: VecDeque::new(),
            rejected: Vec::new(),
            held_back: Vec::new(),
            last_server_seq: ServerSeq::zero(),
            last_timestamp: 0,
            last_seen: BTreeMap::new(),
            errors: VecDeque::new(),
        }
    }

    /// This device's client id.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The device's current vector clock.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Stamp a new local operation without queueing it.
    ///
    /// Increments the device's counter. The timestamp is `now_ms`, raised to
    /// one past the highest timestamp seen so far when the wall clock lags,
    /// so a causally newer write never carries an older timestamp.
    pub fn prepare(
        &mut self,
        op_type: OpType,
        entity_type: EntityType,
        entity_id: Option<String>,
        payload: serde_json::Value,
        now_ms: i64,
    ) -> Operation {
        self.clock.increment(&self.client_id);
        let timestamp = now_ms.max(self.last_timestamp.saturating_add(1));
        self.last_timestamp = timestamp;
        Operation::new(
            self.client_id.clone(),
            op_type,
            entity_type,
            entity_id,
            payload,
            self.clock.clone(),
            timestamp,
        )
    }

    /// Append a prepared operation to the pending queue.
    pub fn enqueue(&mut self, op: Operation) -> Result<(), LogError> {
        if self.is_full() {
            return Err(LogError::Full {
                capacity: self.max_pending,
            });
        }
        self.pending.push_back(op);
        Ok(())
    }

    /// True when no more operations can be queued.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_pending
    }

    /// Pending operations, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    /// Copy of every pending operation, oldest first.
    pub fn pending_batch(&self) -> Vec<Operation> {
        self.pending.iter().cloned().collect()
    }

    /// Number of pending operations.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Confirm an operation is stored on the server.
    pub fn ack(&mut self, op_id: &OpId) -> bool {
        match self.pending.iter().position(|op| &op.id == op_id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Move a pending operation to the rejected list.
    pub fn reject(&mut self, op_id: &OpId, code: impl Into<String>, message: impl Into<String>) -> bool {
        let Some(index) = self.pending.iter().position(|op| &op.id == op_id) else {
            return false;
        };
        if let Some(op) = self.pending.remove(index) {
            self.rejected.push(RejectedOp {
                op,
                code: code.into(),
                message: message.into(),
            });
        }
        true
    }

    /// Operations the server refused.
    pub fn rejected(&self) -> &[RejectedOp] {
        &self.rejected
    }

    /// Fold a remote operation's history into the local clock.
    pub fn observe_remote(&mut self, op: &Operation, now_ms: i64) {
        self.clock.merge(&op.vector_clock);
        self.last_timestamp = self.last_timestamp.max(op.client_timestamp);
        if op.client_id != self.client_id {
            self.last_seen.insert(op.client_id.clone(), now_ms);
        }
    }

    /// Highest sequence fully applied locally.
    pub fn last_server_seq(&self) -> ServerSeq {
        self.last_server_seq
    }

    /// Move the cursor forward. Never moves it back.
    pub fn advance_cursor(&mut self, seq: ServerSeq) -> bool {
        if seq > self.last_server_seq {
            self.last_server_seq = seq;
            true
        } else {
            false
        }
    }

    /// Rewind the cursor to zero so the next pull replays retained history.
    pub fn reset_cursor(&mut self) {
        self.last_server_seq = ServerSeq::zero();
    }

    /// Keep a downloaded operation for a later client version.
    pub fn hold_back(&mut self, op: ServerOperation) {
        if !self.held_back.iter().any(|h| h.op.id == op.op.id) {
            self.held_back.push(op);
        }
    }

    /// Take every held-back operation, in sequence order.
    pub fn take_held_back(&mut self) -> Vec<ServerOperation> {
        let mut ops = std::mem::take(&mut self.held_back);
        ops.sort_by_key(|op| op.server_seq);
        ops
    }

    /// Number of held-back operations.
    pub fn held_back_count(&self) -> usize {
        self.held_back.len()
    }

    /// Record a per-operation failure. Only the newest entries are kept.
    pub fn record_error(&mut self, error: RecordedError) {
        if self.errors.len() >= MAX_RECORDED_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
    }

    /// Recorded errors, oldest first.
    pub fn errors(&self) -> impl Iterator<Item = &RecordedError> {
        self.errors.iter()
    }

    /// Drop clock entries for clients not seen within `retention_ms`.
    ///
    /// This device's own entry is always kept.
    pub fn prune_clock(&mut self, now_ms: i64, retention_ms: i64) -> usize {
        let cutoff = now_ms.saturating_sub(retention_ms);
        self.last_seen.retain(|_, seen| *seen >= cutoff);

        let mut retained: BTreeSet<ClientId> = self.last_seen.keys().cloned().collect();
        retained.insert(self.client_id.clone());
        self.clock.prune(&retained)
    }
}
