//! A map from keys to sets of values.

use std::collections::HashMap;

use prost_types::Any;
use tracing::debug;

use crate::any_support::{comparable_key, AnySupport, ComparableKey};
use crate::crdt::{CrdtError, ReplicatedSet};
use crate::proto::{ReplicatedMultiMapDelta, ReplicatedMultiMapEntryDelta};

#[derive(Debug, Clone)]
struct MultiMapEntry {
    key: Any,
    values: ReplicatedSet,
}

/// Replicated multimap: each key maps to a replicated set of values.
/// Entries self-create on first put; removing a key's last value removes
/// the key.
#[derive(Debug, Clone, Default)]
pub struct MultiMap {
    entries: HashMap<ComparableKey, MultiMapEntry>,
    removed: HashMap<ComparableKey, Any>,
    cleared: bool,
}

impl MultiMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterate the values bound to a key. Empty for an absent key.
    pub fn get(&self, key: &Any) -> impl Iterator<Item = &Any> {
        self.entries
            .get(&comparable_key(key))
            .into_iter()
            .flat_map(|e| e.values.iter())
    }

    pub fn has(&self, key: &Any) -> bool {
        self.entries.contains_key(&comparable_key(key))
    }

    pub fn has_value(&self, key: &Any, value: &Any) -> bool {
        self.entries
            .get(&comparable_key(key))
            .is_some_and(|e| e.values.has(value))
    }

    /// Number of keys.
    pub fn key_size(&self) -> usize {
        self.entries.len()
    }

    /// Total number of key-value bindings.
    pub fn size(&self) -> usize {
        self.entries.values().map(|e| e.values.size()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Any> {
        self.entries.values().map(|e| &e.key)
    }

    /// Bind a value to a key. Returns false when already bound.
    pub fn put(&mut self, key: Any, value: Any) -> bool {
        let ck = comparable_key(&key);
        self.entries
            .entry(ck)
            .or_insert_with(|| MultiMapEntry {
                key,
                values: ReplicatedSet::new(),
            })
            .values
            .add(value)
    }

    /// Remove one value binding. Removing the last binding removes the key.
    pub fn remove(&mut self, key: &Any, value: &Any) -> bool {
        let ck = comparable_key(key);
        let Some(entry) = self.entries.get_mut(&ck) else {
            return false;
        };
        let removed = entry.values.delete(value);
        if removed && entry.values.is_empty() {
            let entry = self.entries.remove(&ck).expect("entry present");
            self.removed.insert(ck, entry.key);
        }
        removed
    }

    /// Remove a key and all its bindings. Returns false when absent.
    pub fn remove_all(&mut self, key: &Any) -> bool {
        let ck = comparable_key(key);
        match self.entries.remove(&ck) {
            None => false,
            Some(entry) => {
                self.removed.insert(ck, entry.key);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.removed.clear();
        self.cleared = true;
    }

    pub fn get_and_reset_delta(&mut self, initial: bool) -> Option<ReplicatedMultiMapDelta> {
        let mut updated = Vec::new();
        for entry in self.entries.values_mut() {
            if let Some(delta) = entry.values.get_and_reset_delta(initial) {
                updated.push(ReplicatedMultiMapEntryDelta {
                    key: Some(entry.key.clone()),
                    delta: Some(delta),
                });
            }
        }

        if initial {
            self.removed.clear();
            self.cleared = false;
            return Some(ReplicatedMultiMapDelta {
                cleared: false,
                removed: Vec::new(),
                updated,
            });
        }

        if !self.cleared && self.removed.is_empty() && updated.is_empty() {
            return None;
        }

        let delta = ReplicatedMultiMapDelta {
            cleared: self.cleared,
            removed: self.removed.values().cloned().collect(),
            updated,
        };
        self.removed.clear();
        self.cleared = false;
        Some(delta)
    }

    pub fn apply_delta(
        &mut self,
        delta: &ReplicatedMultiMapDelta,
        any_support: &AnySupport,
    ) -> Result<(), CrdtError> {
        if delta.cleared {
            self.entries.clear();
        }
        for key in &delta.removed {
            let ck = any_support.to_comparable(key)?;
            if self.entries.remove(&ck).is_none() {
                debug!(type_url = %key.type_url, "Ignoring remove of absent multimap key");
            }
        }
        for entry in &delta.updated {
            let key = entry.key.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            let set_delta = entry.delta.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            let ck = any_support.to_comparable(key)?;
            let entry = self
                .entries
                .entry(ck.clone())
                .or_insert_with(|| MultiMapEntry {
                    key: key.clone(),
                    values: ReplicatedSet::new(),
                });
            entry.values.apply_delta(set_delta, any_support)?;
            if entry.values.is_empty() {
                self.entries.remove(&ck);
            }
        }
        Ok(())
    }
}
