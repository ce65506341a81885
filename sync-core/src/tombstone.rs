//! Delete markers.
//!
//! A tombstone records that an entity was deleted so that stale operations
//! from an offline device cannot resurrect it. Entity ids are never reused,
//! so a tombstone is final until it is pruned.

use opsync_types::{EntityType, OpId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One delete marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Operation that caused the delete (directly or by cascade).
    pub deleted_by: OpId,
    /// Timestamp of that operation, ms since epoch.
    pub deleted_at: i64,
}

/// Set of tombstones keyed by entity type and id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TombstoneSet(BTreeMap<EntityType, BTreeMap<String, Tombstone>>);

impl TombstoneSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delete. An existing tombstone is kept.
    pub fn insert(&mut self, entity_type: EntityType, id: &str, tombstone: Tombstone) {
        self.0
            .entry(entity_type)
            .or_default()
            .entry(id.to_string())
            .or_insert(tombstone);
    }

    /// True when the entity was deleted.
    pub fn contains(&self, entity_type: EntityType, id: &str) -> bool {
        self.get(entity_type, id).is_some()
    }

    /// Look up a tombstone.
    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<&Tombstone> {
        self.0.get(&entity_type)?.get(id)
    }

    /// Drop a tombstone (an authoritative restore point re-created the entity).
    pub fn remove(&mut self, entity_type: EntityType, id: &str) -> bool {
        let Some(map) = self.0.get_mut(&entity_type) else {
            return false;
        };
        let removed = map.remove(id).is_some();
        if map.is_empty() {
            self.0.remove(&entity_type);
        }
        removed
    }

    /// Drop tombstones older than `cutoff_ms`; returns how many were dropped.
    pub fn prune_older_than(&mut self, cutoff_ms: i64) -> usize {
        let mut dropped = 0;
        for map in self.0.values_mut() {
            let before = map.len();
            map.retain(|_, t| t.deleted_at >= cutoff_ms);
            dropped += before - map.len();
        }
        self.0.retain(|_, map| !map.is_empty());
        dropped
    }

    /// Total tombstones.
    pub fn len(&self) -> usize {
        self.0.values().map(|m| m.len()).sum()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
