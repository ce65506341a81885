//! Entity persistence boundary.
//!
//! The sync engine never knows how an application stores its entities. It
//! reads and writes them through [`EntityStore`], keyed by [`EntityType`]
//! and entity id, with entity bodies as JSON objects.
//!
//! [`MemoryStore`] is the in-tree implementation, used by tests and by the
//! command-line client (which persists it as JSON).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use opsync_types::EntityType;

/// Entities of one type, by id.
pub type EntityMap = BTreeMap<String, Value>;

/// Complete application state, as carried by restore points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<EntityType, EntityMap>);

impl Snapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entities of one type.
    pub fn entities(&self, entity_type: EntityType) -> Option<&EntityMap> {
        self.0.get(&entity_type)
    }

    /// Insert one entity.
    pub fn insert(&mut self, entity_type: EntityType, id: impl Into<String>, value: Value) {
        self.0.entry(entity_type).or_default().insert(id.into(), value);
    }

    /// Iterate `(type, id, body)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (EntityType, &String, &Value)> {
        self.0
            .iter()
            .flat_map(|(t, map)| map.iter().map(move |(id, v)| (*t, id, v)))
    }

    /// Total number of entities.
    pub fn len(&self) -> usize {
        self.0.values().map(|m| m.len()).sum()
    }

    /// True when no entities are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize to a JSON value (restore point payload).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse from a restore point payload.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Snapshot::deserialize(value)
    }
}

/// How the resolver treats an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityShape {
    /// Entities form a tree through `parent_field`; deletes and archives
    /// cascade to every descendant present in current state.
    Hierarchical {
        /// Field holding the parent id.
        parent_field: &'static str,
    },
    /// Independent entities.
    Flat,
    /// Audit-only records that never change application state.
    Marker,
    /// The whole state; only restore points may target it.
    WholeState,
}

/// Field holding the archived flag on hierarchical entities.
pub const ARCHIVED_FIELD: &str = "isArchived";

/// Shape of each entity type.
pub fn shape_of(entity_type: EntityType) -> EntityShape {
    match entity_type {
        EntityType::Task => EntityShape::Hierarchical {
            parent_field: "parentId",
        },
        EntityType::Project
        | EntityType::Tag
        | EntityType::Note
        | EntityType::GlobalConfig
        | EntityType::TimeTracking
        | EntityType::SimpleCounter
        | EntityType::WorkContext
        | EntityType::TaskRepeatCfg
        | EntityType::IssueProvider
        | EntityType::Planner
        | EntityType::MenuTree
        | EntityType::Metric
        | EntityType::Board
        | EntityType::Reminder
        | EntityType::PluginUserData
        | EntityType::PluginMetadata => EntityShape::Flat,
        EntityType::Migration | EntityType::Recovery => EntityShape::Marker,
        EntityType::All => EntityShape::WholeState,
    }
}

/// Narrow read/write interface to the application's entity storage.
pub trait EntityStore {
    /// Read one entity.
    fn get(&self, entity_type: EntityType, id: &str) -> Option<Value>;

    /// Insert or replace one entity.
    fn put(&mut self, entity_type: EntityType, id: &str, value: Value);

    /// Remove one entity, returning its last body.
    fn remove(&mut self, entity_type: EntityType, id: &str) -> Option<Value>;

    /// Ids of every entity of one type.
    fn ids(&self, entity_type: EntityType) -> Vec<String>;

    /// Export the complete state.
    fn snapshot(&self) -> Snapshot;

    /// Direct children of `parent_id` through `parent_field`.
    fn children_of(&self, entity_type: EntityType, parent_field: &str, parent_id: &str) -> Vec<String> {
        self.ids(entity_type)
            .into_iter()
            .filter(|id| {
                self.get(entity_type, id)
                    .and_then(|v| v.get(parent_field).and_then(Value::as_str).map(str::to_owned))
                    .is_some_and(|p| p == parent_id)
            })
            .collect()
    }

    /// Every descendant of `root_id`, breadth first, computed from current
    /// state. Cycles are cut.
    fn descendants_of(&self, entity_type: EntityType, parent_field: &str, root_id: &str) -> Vec<String> {
        let mut seen = BTreeSet::from([root_id.to_string()]);
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root_id.to_string()]);
        while let Some(parent) = queue.pop_front() {
            for child in self.children_of(entity_type, parent_field, &parent) {
                if seen.insert(child.clone()) {
                    out.push(child.clone());
                    queue.push_back(child);
                }
            }
        }
        out
    }
}

/// In-memory [`EntityStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStore {
    state: Snapshot,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities of one type.
    pub fn count(&self, entity_type: EntityType) -> usize {
        self.state.entities(entity_type).map_or(0, |m| m.len())
    }
}

impl EntityStore for MemoryStore {
    fn get(&self, entity_type: EntityType, id: &str) -> Option<Value> {
        self.state.entities(entity_type)?.get(id).cloned()
    }

    fn put(&mut self, entity_type: EntityType, id: &str, value: Value) {
        self.state.insert(entity_type, id, value);
    }

    fn remove(&mut self, entity_type: EntityType, id: &str) -> Option<Value> {
        let map = self.state.0.get_mut(&entity_type)?;
        let removed = map.remove(id);
        if map.is_empty() {
            self.state.0.remove(&entity_type);
        }
        removed
    }

    fn ids(&self, entity_type: EntityType) -> Vec<String> {
        self.state
            .entities(entity_type)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Snapshot {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(parent: Option<&str>) -> Value {
        json!({ "title": "t", "parentId": parent })
    }

    #[test]
    fn every_entity_type_has_a_shape() {
        for t in EntityType::ALL_TYPES {
            let shape = shape_of(t);
            assert_eq!(shape == EntityShape::WholeState, t == EntityType::All);
        }
    }

    #[test]
    fn put_get_remove() {
        let mut store = MemoryStore::new();
        store.put(EntityType::Tag, "t1", json!({"title": "urgent"}));
        assert_eq!(store.count(EntityType::Tag), 1);
        assert_eq!(store.get(EntityType::Tag, "t1").unwrap()["title"], "urgent");

        assert!(store.remove(EntityType::Tag, "t1").is_some());
        assert!(store.get(EntityType::Tag, "t1").is_none());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn descendants_are_computed_from_current_state() {
        let mut store = MemoryStore::new();
        store.put(EntityType::Task, "root", task(None));
        store.put(EntityType::Task, "a", task(Some("root")));
        store.put(EntityType::Task, "b", task(Some("root")));
        store.put(EntityType::Task, "a1", task(Some("a")));
        store.put(EntityType::Task, "other", task(None));

        let mut found = store.descendants_of(EntityType::Task, "parentId", "root");
        found.sort();
        assert_eq!(found, vec!["a", "a1", "b"]);
    }

    #[test]
    fn descendants_survive_cycles() {
        let mut store = MemoryStore::new();
        store.put(EntityType::Task, "x", task(Some("y")));
        store.put(EntityType::Task, "y", task(Some("x")));

        assert_eq!(store.descendants_of(EntityType::Task, "parentId", "x"), vec!["y"]);
    }

    #[test]
    fn snapshot_json_is_keyed_by_entity_type() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(EntityType::Task, "t1", json!({"title": "a"}));
        let value = snapshot.to_value();
        assert_eq!(value["TASK"]["t1"]["title"], "a");

        let back = Snapshot::from_value(&value).unwrap();
        assert_eq!(back, snapshot);
    }
}
