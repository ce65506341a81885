//! Vector clocks for causal ordering of operations.
//!
//! Every client keeps a counter for itself plus the highest counter it has
//! observed from every other client. A local mutation increments the
//! writer's own counter and stamps the operation with the full map.
//!
//! Two clocks are *causally ordered* when one is entrywise `<=` the other
//! and they differ; otherwise they are *concurrent*. Missing entries count
//! as zero, so `{A: 0, B: 5}` equals `{B: 5}`.

use crate::ids::ClientId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Both clocks describe the same causal history.
    Equal,
    /// `self` happened before `other`.
    LessThan,
    /// `self` happened after `other`.
    GreaterThan,
    /// Neither clock dominates; the writes are concurrent.
    Concurrent,
}

/// A map of client id to counter.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ClientId, u64>);

impl VectorClock {
    /// Reserved entry holding the folded counters of pruned clients.
    pub const FLOOR_KEY: &'static str = "__floor__";

    /// Create an empty clock.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Counter for `client`, zero when absent.
    pub fn get(&self, client: &ClientId) -> u64 {
        self.0.get(client).copied().unwrap_or(0)
    }

    /// Number of entries (including a floor entry, if any).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no client has written yet.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&c| c == 0)
    }

    /// Iterate entries in client id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, u64)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    /// Bump `client`'s counter and return the new value.
    pub fn increment(&mut self, client: &ClientId) -> u64 {
        let counter = self.0.entry(client.clone()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Take the entrywise maximum of `self` and `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client, &counter) in &other.0 {
            let entry = self.0.entry(client.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Return the merge of two clocks without modifying either.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Compare two clocks.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        let keys: BTreeSet<&ClientId> = self.0.keys().chain(other.0.keys()).collect();
        for key in keys {
            match self.get(key).cmp(&other.get(key)) {
                Ordering::Greater => self_ahead = true,
                Ordering::Less => other_ahead = true,
                Ordering::Equal => {}
            }
            if self_ahead && other_ahead {
                return ClockOrdering::Concurrent;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::GreaterThan,
            (false, true) => ClockOrdering::LessThan,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when `self` causally precedes `other`.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::LessThan
    }

    /// True when neither clock dominates the other.
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Drop entries for clients outside `retained`.
    ///
    /// Pruned counters fold into [`Self::FLOOR_KEY`] as their maximum, so a
    /// pruned clock never claims to dominate a clock it did not observe:
    /// comparisons against the dropped clients degrade to `Concurrent`.
    /// Returns the number of entries removed.
    pub fn prune(&mut self, retained: &BTreeSet<ClientId>) -> usize {
        let floor_key = ClientId::new(Self::FLOOR_KEY);
        let doomed: Vec<ClientId> = self
            .0
            .keys()
            .filter(|k| **k != floor_key && !retained.contains(*k))
            .cloned()
            .collect();

        let mut floor = self.get(&floor_key);
        for client in &doomed {
            if let Some(counter) = self.0.remove(client) {
                floor = floor.max(counter);
            }
        }
        if floor > 0 {
            self.0.insert(floor_key, floor);
        }
        doomed.len()
    }
}

impl FromIterator<(ClientId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ClientId, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Debug for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (client, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", client, counter)?;
        }
        f.write_str("}")
    }
}
