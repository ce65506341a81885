//! Conflict resolution for incoming operations.
//!
//! Every applied write leaves a [`Stamp`] (vector clock, timestamp, client
//! id) on each field it set. An incoming write to a field is judged against
//! that stamp:
//!
//! - causally newer: applied
//! - causally older or equal: skipped as stale
//! - concurrent: Last-Write-Wins on `(timestamp, client id)`
//!
//! Because local timestamps never go backwards across causal edges, every
//! field ends up holding the maximum write under one total order, whatever
//! order the writes arrived in. Deletes are final: a tombstone beats any
//! concurrent write, and deleting a task removes every descendant present in
//! current state, not only those the writer knew about.

use crate::store::{shape_of, EntityShape, EntityStore, Snapshot, ARCHIVED_FIELD};
use crate::tombstone::{Tombstone, TombstoneSet};
use opsync_types::{ClientId, ClockOrdering, EntityType, OpId, OpType, Operation, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Provenance of a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stamp {
    /// Writer's causal history.
    pub clock: VectorClock,
    /// Writer's timestamp (LWW tiebreaker).
    pub timestamp: i64,
    /// Writer (final tiebreaker).
    pub client_id: ClientId,
}

/// How an incoming write relates to the stamp it would replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Causally newer.
    Newer,
    /// Causally older or the same write.
    Stale,
    /// Concurrent, and wins Last-Write-Wins.
    ConcurrentWin,
    /// Concurrent, and loses Last-Write-Wins.
    ConcurrentLoss,
}

impl Verdict {
    /// The incoming write should take effect.
    pub fn applies(&self) -> bool {
        matches!(self, Verdict::Newer | Verdict::ConcurrentWin)
    }

    /// The two writes were concurrent.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Verdict::ConcurrentWin | Verdict::ConcurrentLoss)
    }
}

impl Stamp {
    /// Stamp of an operation.
    pub fn of(op: &Operation) -> Self {
        Self {
            clock: op.vector_clock.clone(),
            timestamp: op.client_timestamp,
            client_id: op.client_id.clone(),
        }
    }

    /// Judge an `incoming` write against this (existing) stamp.
    pub fn judge(&self, incoming: &Stamp) -> Verdict {
        match incoming.clock.compare(&self.clock) {
            ClockOrdering::GreaterThan => Verdict::Newer,
            ClockOrdering::LessThan | ClockOrdering::Equal => Verdict::Stale,
            ClockOrdering::Concurrent => {
                if (incoming.timestamp, &incoming.client_id) > (self.timestamp, &self.client_id) {
                    Verdict::ConcurrentWin
                } else {
                    Verdict::ConcurrentLoss
                }
            }
        }
    }
}

/// Per-entity write history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EntityVersion {
    created: Stamp,
    #[serde(default)]
    fields: BTreeMap<String, Stamp>,
}

impl EntityVersion {
    /// Version of an entity first written with `fields`.
    fn new(created: Stamp, fields: &Map<String, Value>) -> Self {
        let fields = fields
            .keys()
            .map(|name| (name.clone(), created.clone()))
            .collect();
        Self { created, fields }
    }

    /// A field nobody has written yet accepts any write.
    fn judge_field(&self, name: &str, incoming: &Stamp) -> Verdict {
        match self.fields.get(name) {
            Some(existing) => existing.judge(incoming),
            None => Verdict::Newer,
        }
    }

    fn stamps(&self) -> impl Iterator<Item = &Stamp> {
        std::iter::once(&self.created).chain(self.fields.values())
    }
}

/// Why an operation changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Already superseded by causally newer writes.
    Stale,
    /// Lost Last-Write-Wins against a concurrent write.
    LostConflict,
    /// Targets a deleted entity.
    Tombstoned,
    /// Would attach an entity to a deleted parent; dropped instead.
    OrphanDropped,
    /// Audit-only entity type.
    AuditOnly,
}

/// Result of applying one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State changed.
    Applied {
        /// A concurrent write was resolved along the way.
        conflict: bool,
        /// Descendants changed by cascade.
        cascaded: usize,
    },
    /// State unchanged.
    Skipped(SkipReason),
}

impl ApplyOutcome {
    /// True when a concurrent write was involved (won or lost).
    pub fn had_conflict(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Applied { conflict: true, .. }
                | ApplyOutcome::Skipped(SkipReason::LostConflict)
        )
    }
}

/// An operation that cannot be applied at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// Entity-level operation without an entity id
    #[error("op {op_id}: missing entity id")]
    MissingEntityId {
        /// Offending operation.
        op_id: OpId,
    },

    /// Update of an entity that was never created here
    #[error("op {op_id}: {entity_type} {entity_id} does not exist")]
    MissingEntity {
        /// Offending operation.
        op_id: OpId,
        /// Target type.
        entity_type: EntityType,
        /// Target id.
        entity_id: String,
    },

    /// Payload has the wrong shape
    #[error("op {op_id}: invalid payload for {entity_type} {entity_id}: {reason}")]
    InvalidPayload {
        /// Offending operation.
        op_id: OpId,
        /// Target type.
        entity_type: EntityType,
        /// Target id (empty for whole-state operations).
        entity_id: String,
        /// What was wrong.
        reason: String,
    },

    /// Operation kind cannot target this entity type
    #[error("op {op_id}: {op_type} cannot target {entity_type}")]
    InvalidTarget {
        /// Offending operation.
        op_id: OpId,
        /// Operation kind.
        op_type: OpType,
        /// Target type.
        entity_type: EntityType,
    },
}

impl ApplyError {
    /// Operation the error refers to.
    pub fn op_id(&self) -> &OpId {
        match self {
            ApplyError::MissingEntityId { op_id }
            | ApplyError::MissingEntity { op_id, .. }
            | ApplyError::InvalidPayload { op_id, .. }
            | ApplyError::InvalidTarget { op_id, .. } => op_id,
        }
    }
}

/// Applies operations to an [`EntityStore`], resolving conflicts.
///
/// Holds the per-field write history and the tombstone set; both must be
/// persisted alongside the entity store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolver {
    versions: BTreeMap<EntityType, BTreeMap<String, EntityVersion>>,
    tombstones: TombstoneSet,
}

impl ConflictResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tombstones recorded so far.
    pub fn tombstones(&self) -> &TombstoneSet {
        &self.tombstones
    }

    /// True when the entity was deleted.
    pub fn is_tombstoned(&self, entity_type: EntityType, id: &str) -> bool {
        self.tombstones.contains(entity_type, id)
    }

    /// Drop tombstones older than `cutoff_ms`.
    pub fn prune_tombstones(&mut self, cutoff_ms: i64) -> usize {
        self.tombstones.prune_older_than(cutoff_ms)
    }

    /// Apply one operation (local or remote).
    pub fn apply<S: EntityStore + ?Sized>(
        &mut self,
        store: &mut S,
        op: &Operation,
    ) -> Result<ApplyOutcome, ApplyError> {
        let shape = shape_of(op.entity_type);

        match (op.op_type, shape) {
            (OpType::SyncImport | OpType::BackupImport | OpType::Repair, EntityShape::WholeState) => {
                self.apply_restore_point(store, op)
            }
            (OpType::SyncImport | OpType::BackupImport | OpType::Repair, _) => {
                Err(self.invalid_target(op))
            }
            (_, EntityShape::Marker) => Ok(ApplyOutcome::Skipped(SkipReason::AuditOnly)),
            (_, EntityShape::WholeState) => Err(self.invalid_target(op)),
            (OpType::Create, _) => {
                let id = entity_id(op)?;
                let fields = object_payload(op, &op.payload)?;
                self.upsert(store, op, shape, id, fields)
            }
            (OpType::Update | OpType::Move, _) => {
                let id = entity_id(op)?;
                let fields = object_payload(op, &op.payload)?;
                if self.is_tombstoned(op.entity_type, id) {
                    return Ok(ApplyOutcome::Skipped(SkipReason::Tombstoned));
                }
                if store.get(op.entity_type, id).is_none() {
                    return Err(ApplyError::MissingEntity {
                        op_id: op.id.clone(),
                        entity_type: op.entity_type,
                        entity_id: id.to_string(),
                    });
                }
                self.upsert(store, op, shape, id, fields)
            }
            (OpType::Delete, _) => {
                let id = entity_id(op)?;
                Ok(self.delete(store, op, shape, id))
            }
            (OpType::Batch, _) => self.apply_batch(store, op, shape),
        }
    }

    fn invalid_target(&self, op: &Operation) -> ApplyError {
        ApplyError::InvalidTarget {
            op_id: op.id.clone(),
            op_type: op.op_type,
            entity_type: op.entity_type,
        }
    }

    /// Create the entity, or merge into it field by field.
    fn upsert<S: EntityStore + ?Sized>(
        &mut self,
        store: &mut S,
        op: &Operation,
        shape: EntityShape,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let entity_type = op.entity_type;
        if self.is_tombstoned(entity_type, id) {
            return Ok(ApplyOutcome::Skipped(SkipReason::Tombstoned));
        }
        let stamp = Stamp::of(op);

        if store.get(entity_type, id).is_none() {
            if let EntityShape::Hierarchical { parent_field } = shape {
                if let Some(parent) = fields.get(parent_field).and_then(Value::as_str) {
                    if self.is_tombstoned(entity_type, parent) {
                        self.tombstone(entity_type, id, op);
                        return Ok(ApplyOutcome::Skipped(SkipReason::OrphanDropped));
                    }
                }
            }
            store.put(entity_type, id, Value::Object(fields.clone()));
            self.versions
                .entry(entity_type)
                .or_default()
                .insert(id.to_string(), EntityVersion::new(stamp, fields));
            return Ok(ApplyOutcome::Applied {
                conflict: false,
                cascaded: 0,
            });
        }

        let merge = self.merge_fields(store, entity_type, id, fields, &stamp);
        if merge.applied.is_empty() {
            let reason = if merge.conflict {
                SkipReason::LostConflict
            } else {
                SkipReason::Stale
            };
            return Ok(ApplyOutcome::Skipped(reason));
        }

        let mut cascaded = 0;
        if let EntityShape::Hierarchical { parent_field } = shape {
            if let Some(parent) = merge.applied.get(parent_field).and_then(Value::as_str) {
                if self.is_tombstoned(entity_type, parent) {
                    self.delete(store, op, shape, id);
                    return Ok(ApplyOutcome::Skipped(SkipReason::OrphanDropped));
                }
            }
            if merge.applied.get(ARCHIVED_FIELD) == Some(&Value::Bool(true)) {
                let mut archived = Map::new();
                archived.insert(ARCHIVED_FIELD.to_string(), Value::Bool(true));
                for child in store.descendants_of(entity_type, parent_field, id) {
                    let child_merge = self.merge_fields(store, entity_type, &child, &archived, &stamp);
                    if !child_merge.applied.is_empty() {
                        cascaded += 1;
                    }
                }
            }
        }

        Ok(ApplyOutcome::Applied {
            conflict: merge.conflict,
            cascaded,
        })
    }

    /// Judge each field against its stamp and write the winners.
    fn merge_fields<S: EntityStore + ?Sized>(
        &mut self,
        store: &mut S,
        entity_type: EntityType,
        id: &str,
        fields: &Map<String, Value>,
        stamp: &Stamp,
    ) -> FieldMerge {
        let mut body = match store.get(entity_type, id) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let version = self
            .versions
            .entry(entity_type)
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| EntityVersion::new(origin_stamp(), &Map::new()));

        let mut merge = FieldMerge::default();
        for (name, value) in fields {
            let verdict = version.judge_field(name, stamp);
            merge.conflict |= verdict.is_conflict();
            if verdict.applies() {
                body.insert(name.clone(), value.clone());
                version.fields.insert(name.clone(), stamp.clone());
                merge.applied.insert(name.clone(), value.clone());
            }
        }

        if !merge.applied.is_empty() {
            store.put(entity_type, id, Value::Object(body));
        }
        merge
    }

    /// Remove the entity (and, for trees, every current descendant).
    fn delete<S: EntityStore + ?Sized>(
        &mut self,
        store: &mut S,
        op: &Operation,
        shape: EntityShape,
        id: &str,
    ) -> ApplyOutcome {
        let entity_type = op.entity_type;
        if self.is_tombstoned(entity_type, id) {
            return ApplyOutcome::Skipped(SkipReason::Tombstoned);
        }

        let stamp = Stamp::of(op);
        let conflict = self
            .versions
            .get(&entity_type)
            .and_then(|m| m.get(id))
            .is_some_and(|v| v.stamps().any(|s| s.judge(&stamp).is_conflict()));

        let mut doomed = vec![id.to_string()];
        if let EntityShape::Hierarchical { parent_field } = shape {
            doomed.extend(store.descendants_of(entity_type, parent_field, id));
        }

        for target in &doomed {
            store.remove(entity_type, target);
            self.tombstone(entity_type, target, op);
        }

        ApplyOutcome::Applied {
            conflict,
            cascaded: doomed.len() - 1,
        }
    }

    fn tombstone(&mut self, entity_type: EntityType, id: &str, op: &Operation) {
        if let Some(map) = self.versions.get_mut(&entity_type) {
            map.remove(id);
        }
        self.tombstones.insert(
            entity_type,
            id,
            Tombstone {
                deleted_by: op.id.clone(),
                deleted_at: op.client_timestamp,
            },
        );
    }

    /// `{"entities": {"<id>": {<fields>}, ...}}`, each upserted.
    fn apply_batch<S: EntityStore + ?Sized>(
        &mut self,
        store: &mut S,
        op: &Operation,
        shape: EntityShape,
    ) -> Result<ApplyOutcome, ApplyError> {
        let entities = op
            .payload
            .get("entities")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid_payload(op, "batch payload needs an `entities` object"))?;

        let mut applied = 0usize;
        let mut conflict = false;
        let mut last_skip = SkipReason::Stale;
        for (id, fields) in entities {
            let fields = object_payload(op, fields)?;
            match self.upsert(store, op, shape, id, fields)? {
                ApplyOutcome::Applied {
                    conflict: c,
                    cascaded,
                } => {
                    applied += 1 + cascaded;
                    conflict |= c;
                }
                ApplyOutcome::Skipped(reason) => {
                    conflict |= reason == SkipReason::LostConflict;
                    last_skip = reason;
                }
            }
        }

        if applied == 0 {
            return Ok(ApplyOutcome::Skipped(last_skip));
        }
        Ok(ApplyOutcome::Applied {
            conflict,
            cascaded: applied - 1,
        })
    }

    /// Apply a full-state snapshot.
    fn apply_restore_point<S: EntityStore + ?Sized>(
        &mut self,
        store: &mut S,
        op: &Operation,
    ) -> Result<ApplyOutcome, ApplyError> {
        let snapshot = Snapshot::from_value(&op.payload)
            .map_err(|e| invalid_payload(op, &format!("restore point is not a snapshot: {e}")))?;
        let stamp = Stamp::of(op);
        let mut conflict = false;
        let mut changed = 0usize;

        // Entities the snapshot writer had already seen and dropped.
        for entity_type in EntityType::ALL_TYPES {
            for id in store.ids(entity_type) {
                if snapshot
                    .entities(entity_type)
                    .is_some_and(|m| m.contains_key(&id))
                {
                    continue;
                }
                let covered = self
                    .versions
                    .get(&entity_type)
                    .and_then(|m| m.get(&id))
                    .map_or(true, |v| v.stamps().all(|s| s.judge(&stamp) == Verdict::Newer));
                if covered {
                    store.remove(entity_type, &id);
                    if let Some(map) = self.versions.get_mut(&entity_type) {
                        map.remove(&id);
                    }
                    changed += 1;
                } else {
                    conflict = true;
                }
            }
        }

        for (entity_type, id, body) in snapshot.iter() {
            let Value::Object(fields) = body else {
                return Err(invalid_payload(op, &format!("{entity_type} {id} is not an object")));
            };
            if self.is_tombstoned(entity_type, id) {
                conflict = true;
                continue;
            }
            if store.get(entity_type, id).is_none() {
                store.put(entity_type, id, body.clone());
                self.versions
                    .entry(entity_type)
                    .or_default()
                    .insert(id.clone(), EntityVersion::new(stamp.clone(), fields));
                changed += 1;
            } else {
                let merge = self.merge_fields(store, entity_type, id, fields, &stamp);
                conflict |= merge.conflict;
                if !merge.applied.is_empty() {
                    changed += 1;
                }
            }
        }

        Ok(ApplyOutcome::Applied {
            conflict,
            cascaded: changed,
        })
    }
}

#[derive(Default)]
struct FieldMerge {
    applied: Map<String, Value>,
    conflict: bool,
}

/// Stamp older than every real write.
fn origin_stamp() -> Stamp {
    Stamp {
        clock: VectorClock::new(),
        timestamp: i64::MIN,
        client_id: ClientId::new(""),
    }
}

fn entity_id(op: &Operation) -> Result<&str, ApplyError> {
    op.entity_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApplyError::MissingEntityId {
            op_id: op.id.clone(),
        })
}

fn object_payload<'a>(op: &Operation, value: &'a Value) -> Result<&'a Map<String, Value>, ApplyError> {
    value
        .as_object()
        .ok_or_else(|| invalid_payload(op, "expected a JSON object"))
}

fn invalid_payload(op: &Operation, reason: &str) -> ApplyError {
    ApplyError::InvalidPayload {
        op_id: op.id.clone(),
        entity_type: op.entity_type,
        entity_id: op.entity_key().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries
            .iter()
            .map(|(k, v)| (ClientId::new(*k), *v))
            .collect()
    }

    fn op(
        client: &str,
        op_type: OpType,
        id: &str,
        payload: Value,
        vc: VectorClock,
        ts: i64,
    ) -> Operation {
        Operation::new(
            ClientId::new(client),
            op_type,
            EntityType::Task,
            Some(id.to_string()),
            payload,
            vc,
            ts,
        )
    }

    fn title(store: &MemoryStore, id: &str) -> Option<String> {
        store
            .get(EntityType::Task, id)
            .and_then(|v| v["title"].as_str().map(str::to_owned))
    }

    // ===========================================
    // Causal ordering
    // ===========================================

    #[test]
    fn causally_newer_update_applies() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let create = op("A", OpType::Create, "t1", json!({"title": "v1"}), clock(&[("A", 1)]), 10);
        let update = op("B", OpType::Update, "t1", json!({"title": "v2"}), clock(&[("A", 1), ("B", 1)]), 5);

        resolver.apply(&mut store, &create).unwrap();
        let outcome = resolver.apply(&mut store, &update).unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { conflict: false, cascaded: 0 });
        assert_eq!(title(&store, "t1").as_deref(), Some("v2"));
    }

    #[test]
    fn stale_update_is_skipped() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let create = op("A", OpType::Create, "t1", json!({"title": "v1"}), clock(&[("A", 1)]), 10);
        let newer = op("A", OpType::Update, "t1", json!({"title": "v3"}), clock(&[("A", 3)]), 30);
        let older = op("A", OpType::Update, "t1", json!({"title": "v2"}), clock(&[("A", 2)]), 20);

        resolver.apply(&mut store, &create).unwrap();
        resolver.apply(&mut store, &newer).unwrap();
        let outcome = resolver.apply(&mut store, &older).unwrap();

        assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::Stale));
        assert_eq!(title(&store, "t1").as_deref(), Some("v3"));
    }

    #[test]
    fn replayed_operation_is_stale() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();
        let create = op("A", OpType::Create, "t1", json!({"title": "v1"}), clock(&[("A", 1)]), 10);
        let update = op("A", OpType::Update, "t1", json!({"title": "v2"}), clock(&[("A", 2)]), 11);

        resolver.apply(&mut store, &create).unwrap();
        resolver.apply(&mut store, &update).unwrap();
        assert_eq!(
            resolver.apply(&mut store, &update).unwrap(),
            ApplyOutcome::Skipped(SkipReason::Stale)
        );
    }

    // ===========================================
    // Concurrent writes
    // ===========================================

    #[test]
    fn concurrent_updates_later_timestamp_wins() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let create = op("A", OpType::Create, "t1", json!({"title": "v1"}), clock(&[("A", 1)]), 10);
        let from_a = op("A", OpType::Update, "t1", json!({"title": "A"}), clock(&[("A", 2)]), 100);
        let from_b = op("B", OpType::Update, "t1", json!({"title": "B"}), clock(&[("A", 1), ("B", 1)]), 200);

        resolver.apply(&mut store, &create).unwrap();
        resolver.apply(&mut store, &from_a).unwrap();
        let outcome = resolver.apply(&mut store, &from_b).unwrap();

        assert!(outcome.had_conflict());
        assert_eq!(title(&store, "t1").as_deref(), Some("B"));
    }

    #[test]
    fn concurrent_update_losing_lww_is_skipped() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let create = op("A", OpType::Create, "t1", json!({"title": "v1"}), clock(&[("A", 1)]), 10);
        let from_a = op("A", OpType::Update, "t1", json!({"title": "A"}), clock(&[("A", 2)]), 300);
        let from_b = op("B", OpType::Update, "t1", json!({"title": "B"}), clock(&[("A", 1), ("B", 1)]), 200);

        resolver.apply(&mut store, &create).unwrap();
        resolver.apply(&mut store, &from_a).unwrap();
        assert_eq!(
            resolver.apply(&mut store, &from_b).unwrap(),
            ApplyOutcome::Skipped(SkipReason::LostConflict)
        );
        assert_eq!(title(&store, "t1").as_deref(), Some("A"));
    }

    #[test]
    fn timestamp_tie_breaks_on_client_id() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let create = op("A", OpType::Create, "t1", json!({"title": "v1"}), clock(&[("A", 1)]), 10);
        let from_a = op("A", OpType::Update, "t1", json!({"title": "A"}), clock(&[("A", 2)]), 100);
        let from_b = op("B", OpType::Update, "t1", json!({"title": "B"}), clock(&[("A", 1), ("B", 1)]), 100);

        resolver.apply(&mut store, &create).unwrap();
        resolver.apply(&mut store, &from_b).unwrap();
        resolver.apply(&mut store, &from_a).unwrap();

        // "B" > "A" lexically
        assert_eq!(title(&store, "t1").as_deref(), Some("B"));
    }

    #[test]
    fn concurrent_updates_converge_in_either_order() {
        let create = op("A", OpType::Create, "t1", json!({"title": "v1", "notes": ""}), clock(&[("A", 1)]), 10);
        let from_a = op("A", OpType::Update, "t1", json!({"title": "A"}), clock(&[("A", 2)]), 100);
        let from_b = op("B", OpType::Update, "t1", json!({"title": "B", "notes": "n"}), clock(&[("A", 1), ("B", 1)]), 50);

        let mut first = MemoryStore::new();
        let mut r1 = ConflictResolver::new();
        for o in [&create, &from_a, &from_b] {
            r1.apply(&mut first, o).unwrap();
        }

        let mut second = MemoryStore::new();
        let mut r2 = ConflictResolver::new();
        for o in [&create, &from_b, &from_a] {
            r2.apply(&mut second, o).unwrap();
        }

        assert_eq!(first, second);
        let task = first.get(EntityType::Task, "t1").unwrap();
        assert_eq!(task["title"], "A");
        assert_eq!(task["notes"], "n");
    }

    #[test]
    fn concurrent_creates_converge_in_either_order() {
        let from_a = op("A", OpType::Create, "t1", json!({"title": "a"}), clock(&[("A", 1)]), 100);
        let from_b = op("B", OpType::Create, "t1", json!({"title": "b", "notes": "x"}), clock(&[("B", 1)]), 50);

        let mut first = MemoryStore::new();
        let mut r1 = ConflictResolver::new();
        r1.apply(&mut first, &from_a).unwrap();
        r1.apply(&mut first, &from_b).unwrap();

        let mut second = MemoryStore::new();
        let mut r2 = ConflictResolver::new();
        r2.apply(&mut second, &from_b).unwrap();
        r2.apply(&mut second, &from_a).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first.get(EntityType::Task, "t1"),
            Some(json!({"title": "a", "notes": "x"}))
        );
    }

    #[test]
    fn first_write_to_a_field_applies_whatever_its_clock() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let create = op("A", OpType::Create, "t1", json!({"title": "v1"}), clock(&[("A", 5)]), 500);
        // Concurrent with the create and earlier in wall time.
        let notes = op("B", OpType::Update, "t1", json!({"notes": "n"}), clock(&[("B", 1)]), 1);

        resolver.apply(&mut store, &create).unwrap();
        let outcome = resolver.apply(&mut store, &notes).unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { conflict: false, cascaded: 0 });
        assert_eq!(store.get(EntityType::Task, "t1").unwrap()["notes"], "n");
    }

    // ===========================================
    // Deletes and tombstones
    // ===========================================

    #[test]
    fn delete_beats_concurrent_update_in_either_order() {
        let create = op("A", OpType::Create, "t1", json!({"title": "v1"}), clock(&[("A", 1)]), 10);
        let delete = op("A", OpType::Delete, "t1", json!({}), clock(&[("A", 2)]), 100);
        let update = op("B", OpType::Update, "t1", json!({"title": "B"}), clock(&[("A", 1), ("B", 1)]), 500);

        let mut first = MemoryStore::new();
        let mut r1 = ConflictResolver::new();
        r1.apply(&mut first, &create).unwrap();
        r1.apply(&mut first, &delete).unwrap();
        assert_eq!(
            r1.apply(&mut first, &update).unwrap(),
            ApplyOutcome::Skipped(SkipReason::Tombstoned)
        );

        let mut second = MemoryStore::new();
        let mut r2 = ConflictResolver::new();
        r2.apply(&mut second, &create).unwrap();
        r2.apply(&mut second, &update).unwrap();
        let outcome = r2.apply(&mut second, &delete).unwrap();
        assert!(outcome.had_conflict());

        assert_eq!(first, second);
        assert!(first.get(EntityType::Task, "t1").is_none());
    }

    #[test]
    fn tombstone_blocks_resurrection() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let create = op("A", OpType::Create, "t1", json!({"title": "v1"}), clock(&[("A", 1)]), 10);
        let delete = op("A", OpType::Delete, "t1", json!({}), clock(&[("A", 2)]), 20);
        resolver.apply(&mut store, &create).unwrap();
        resolver.apply(&mut store, &delete).unwrap();

        assert_eq!(
            resolver.apply(&mut store, &create).unwrap(),
            ApplyOutcome::Skipped(SkipReason::Tombstoned)
        );
        assert!(store.get(EntityType::Task, "t1").is_none());
    }

    #[test]
    fn delete_cascades_to_descendants_from_current_state() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let parent = op("A", OpType::Create, "p", json!({"title": "p"}), clock(&[("A", 1)]), 1);
        let child = op("A", OpType::Create, "c1", json!({"title": "c1", "parentId": "p"}), clock(&[("A", 2)]), 2);
        // Added on B, unknown to the deleting device
        let late_child = op("B", OpType::Create, "c2", json!({"title": "c2", "parentId": "p"}), clock(&[("A", 2), ("B", 1)]), 3);
        let grandchild = op("B", OpType::Create, "g", json!({"title": "g", "parentId": "c2"}), clock(&[("A", 2), ("B", 2)]), 4);
        let delete = op(
            "A",
            OpType::Delete,
            "p",
            json!({"subTaskIds": ["c1"]}),
            clock(&[("A", 3)]),
            5,
        );

        for o in [&parent, &child, &late_child, &grandchild] {
            resolver.apply(&mut store, o).unwrap();
        }
        let outcome = resolver.apply(&mut store, &delete).unwrap();

        assert!(matches!(outcome, ApplyOutcome::Applied { cascaded: 3, .. }));
        assert_eq!(store.count(EntityType::Task), 0);
        for id in ["p", "c1", "c2", "g"] {
            assert!(resolver.is_tombstoned(EntityType::Task, id));
        }
    }

    #[test]
    fn create_under_deleted_parent_is_dropped() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let parent = op("A", OpType::Create, "p", json!({"title": "p"}), clock(&[("A", 1)]), 1);
        let delete = op("A", OpType::Delete, "p", json!({}), clock(&[("A", 2)]), 2);
        let child = op("B", OpType::Create, "c", json!({"title": "c", "parentId": "p"}), clock(&[("A", 1), ("B", 1)]), 3);

        resolver.apply(&mut store, &parent).unwrap();
        resolver.apply(&mut store, &delete).unwrap();

        assert_eq!(
            resolver.apply(&mut store, &child).unwrap(),
            ApplyOutcome::Skipped(SkipReason::OrphanDropped)
        );
        assert!(resolver.is_tombstoned(EntityType::Task, "c"));
    }

    #[test]
    fn move_under_deleted_parent_drops_entity() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let p = op("A", OpType::Create, "p", json!({"title": "p"}), clock(&[("A", 1)]), 1);
        let t = op("A", OpType::Create, "t", json!({"title": "t"}), clock(&[("A", 2)]), 2);
        let del = op("A", OpType::Delete, "p", json!({}), clock(&[("A", 3)]), 3);
        let mv = op("B", OpType::Move, "t", json!({"parentId": "p"}), clock(&[("A", 2), ("B", 1)]), 4);

        for o in [&p, &t, &del] {
            resolver.apply(&mut store, o).unwrap();
        }
        assert_eq!(
            resolver.apply(&mut store, &mv).unwrap(),
            ApplyOutcome::Skipped(SkipReason::OrphanDropped)
        );
        assert!(store.get(EntityType::Task, "t").is_none());
    }

    #[test]
    fn archive_cascades_to_descendants() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let p = op("A", OpType::Create, "p", json!({"title": "p"}), clock(&[("A", 1)]), 1);
        let c = op("A", OpType::Create, "c", json!({"title": "c", "parentId": "p"}), clock(&[("A", 2)]), 2);
        let archive = op("A", OpType::Update, "p", json!({"isArchived": true}), clock(&[("A", 3)]), 3);

        for o in [&p, &c] {
            resolver.apply(&mut store, o).unwrap();
        }
        let outcome = resolver.apply(&mut store, &archive).unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { conflict: false, cascaded: 1 });
        assert_eq!(store.get(EntityType::Task, "c").unwrap()["isArchived"], true);
    }

    // ===========================================
    // Errors and dispatch
    // ===========================================

    #[test]
    fn update_of_unknown_entity_is_an_error() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();
        let update = op("A", OpType::Update, "ghost", json!({"title": "x"}), clock(&[("A", 1)]), 1);

        let err = resolver.apply(&mut store, &update).unwrap_err();
        assert!(matches!(err, ApplyError::MissingEntity { .. }));
        assert_eq!(err.op_id(), &update.id);
    }

    #[test]
    fn non_object_payload_is_an_error() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();
        let create = op("A", OpType::Create, "t", json!("nope"), clock(&[("A", 1)]), 1);

        assert!(matches!(
            resolver.apply(&mut store, &create),
            Err(ApplyError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn marker_entities_are_audit_only() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();
        let mut marker = op("A", OpType::Create, "m", json!({}), clock(&[("A", 1)]), 1);
        marker.entity_type = EntityType::Migration;

        assert_eq!(
            resolver.apply(&mut store, &marker).unwrap(),
            ApplyOutcome::Skipped(SkipReason::AuditOnly)
        );
    }

    #[test]
    fn batch_upserts_each_entity() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();
        let mut batch = op(
            "A",
            OpType::Batch,
            "",
            json!({"entities": {"t1": {"title": "1"}, "t2": {"title": "2"}}}),
            clock(&[("A", 1)]),
            1,
        );
        batch.entity_id = None;

        let outcome = resolver.apply(&mut store, &batch).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        assert_eq!(store.count(EntityType::Task), 2);
    }

    // ===========================================
    // Restore points
    // ===========================================

    fn restore_point(snapshot: &Snapshot, vc: VectorClock, ts: i64) -> Operation {
        Operation::new(
            ClientId::new("A"),
            OpType::SyncImport,
            EntityType::All,
            None,
            snapshot.to_value(),
            vc,
            ts,
        )
    }

    #[test]
    fn restore_point_replaces_covered_state() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let old = op("A", OpType::Create, "old", json!({"title": "old"}), clock(&[("A", 1)]), 1);
        resolver.apply(&mut store, &old).unwrap();

        let mut snapshot = Snapshot::new();
        snapshot.insert(EntityType::Task, "fresh", json!({"title": "fresh"}));
        let rp = restore_point(&snapshot, clock(&[("A", 2)]), 2);

        resolver.apply(&mut store, &rp).unwrap();

        assert!(store.get(EntityType::Task, "old").is_none());
        assert_eq!(title(&store, "fresh").as_deref(), Some("fresh"));
    }

    #[test]
    fn restore_point_keeps_concurrent_entities() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let concurrent = op("B", OpType::Create, "b1", json!({"title": "b"}), clock(&[("B", 1)]), 1);
        resolver.apply(&mut store, &concurrent).unwrap();

        let rp = restore_point(&Snapshot::new(), clock(&[("A", 5)]), 2);
        let outcome = resolver.apply(&mut store, &rp).unwrap();

        assert!(outcome.had_conflict());
        assert!(store.get(EntityType::Task, "b1").is_some());
    }

    #[test]
    fn restore_point_replay_matches_full_history() {
        let create = op("A", OpType::Create, "t1", json!({"title": "v0"}), clock(&[("A", 1)]), 10);
        // Concurrent with the restore point below, which never saw it.
        let notes = op("B", OpType::Update, "t1", json!({"notes": "b"}), clock(&[("A", 1), ("B", 1)]), 200);
        let mut snapshot = Snapshot::new();
        snapshot.insert(EntityType::Task, "t1", json!({"title": "v1"}));
        let rp = restore_point(&snapshot, clock(&[("A", 1), ("R", 1)]), 300);

        let mut full = MemoryStore::new();
        let mut r1 = ConflictResolver::new();
        for o in [&create, &rp, &notes] {
            r1.apply(&mut full, o).unwrap();
        }

        // History before the restore point compacted away.
        let mut compacted = MemoryStore::new();
        let mut r2 = ConflictResolver::new();
        for o in [&rp, &notes] {
            r2.apply(&mut compacted, o).unwrap();
        }

        assert_eq!(full, compacted);
        assert_eq!(
            full.get(EntityType::Task, "t1"),
            Some(json!({"title": "v1", "notes": "b"}))
        );
    }

    #[test]
    fn restore_point_entity_fields_keep_their_stamp() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();

        let mut snapshot = Snapshot::new();
        snapshot.insert(EntityType::Task, "t1", json!({"title": "v1"}));
        resolver
            .apply(&mut store, &restore_point(&snapshot, clock(&[("A", 3)]), 300))
            .unwrap();

        let covered = op("A", OpType::Update, "t1", json!({"title": "old"}), clock(&[("A", 2)]), 200);
        assert_eq!(
            resolver.apply(&mut store, &covered).unwrap(),
            ApplyOutcome::Skipped(SkipReason::Stale)
        );
        assert_eq!(title(&store, "t1").as_deref(), Some("v1"));
    }

    #[test]
    fn restore_point_must_target_all() {
        let mut store = MemoryStore::new();
        let mut resolver = ConflictResolver::new();
        let mut rp = restore_point(&Snapshot::new(), clock(&[("A", 1)]), 1);
        rp.entity_type = EntityType::Task;

        assert!(matches!(
            resolver.apply(&mut store, &rp),
            Err(ApplyError::InvalidTarget { .. })
        ));
    }
}
